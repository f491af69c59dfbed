//! Local status endpoint probed by the station supervisor
//!
//! `GET /status.json` returns the pipeline snapshot, `GET /health` a plain
//! "ok". Bound to loopback only.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pipeline::{PipelineStatus, StreamPipeline};

#[derive(Clone)]
pub struct StatusState {
    pub node_id: String,
    pub pipeline: Arc<StreamPipeline>,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
struct StatusView {
    node_id: String,
    uptime_seconds: u64,
    #[serde(flatten)]
    pipeline: PipelineStatus,
}

pub fn build_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status.json", get(get_status))
        .with_state(state)
}

async fn get_status(State(state): State<StatusState>) -> Json<StatusView> {
    Json(StatusView {
        node_id: state.node_id.clone(),
        uptime_seconds: state.started.elapsed().as_secs(),
        pipeline: state.pipeline.status(),
    })
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status endpoint on {}", addr))
}

/// Serve until `cancel` fires
pub async fn serve(listener: TcpListener, state: StatusState, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("Status listener has no address")?;
    info!("Status endpoint on http://{}/status.json", addr);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Status server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineConfig, SourceKind};
    use crate::transmitter::{Transmitter, TransmitterKind, TransmitterOptions};
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_json_served() {
        let config = PipelineConfig {
            stream_url: "tone://status".into(),
            frequency: 101.1,
            sample_rate: 8000,
            chunk_size: 400,
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(80),
            source: SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs: None,
            },
        };
        let transmitter = Arc::new(Transmitter::from_config(
            TransmitterKind::Simulated,
            101.1,
            &TransmitterOptions::default(),
        ));
        let pipeline = Arc::new(StreamPipeline::new(config, transmitter));
        let state = StatusState {
            node_id: "nyc-01".into(),
            pipeline: Arc::clone(&pipeline),
            started: Instant::now(),
        };

        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, state, cancel.clone()));

        let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/status.json", port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["node_id"], "nyc-01");
        assert_eq!(body["state"], "idle");
        assert_eq!(body["stream_url"], "tone://status");
        assert_eq!(body["transmitter"]["backend"], "simulated");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
