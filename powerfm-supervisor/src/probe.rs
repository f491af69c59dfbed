use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Outcome of one status endpoint probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(status_code: u16) -> Self {
        Self {
            ok: true,
            status_code: Some(status_code),
            error: None,
        }
    }

    pub fn failure(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code,
            error: Some(error.into()),
        }
    }
}

/// Endpoint health check for a station's local port
pub trait StatusProbe: Send + Sync {
    fn probe(&self, port: u16) -> impl Future<Output = ProbeResult> + Send;
}

/// `GET http://127.0.0.1:<port>/status.json`; any 2xx/3xx within the
/// timeout counts as serving
pub struct HttpStatusProbe {
    client: reqwest::Client,
}

impl HttpStatusProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

impl StatusProbe for HttpStatusProbe {
    async fn probe(&self, port: u16) -> ProbeResult {
        let url = format!("http://127.0.0.1:{}/status.json", port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    ProbeResult::success(status.as_u16())
                } else {
                    ProbeResult::failure(Some(status.as_u16()), format!("HTTP {}", status.as_u16()))
                }
            }
            Err(e) if e.is_timeout() => ProbeResult::failure(None, "timed out"),
            Err(e) if e.is_connect() => ProbeResult::failure(None, "connection refused"),
            Err(e) => ProbeResult::failure(None, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_probe_success() {
        let port = serve(Router::new().route("/status.json", get(|| async { "{}" }))).await;
        let probe = HttpStatusProbe::new(Duration::from_secs(3)).unwrap();
        assert_eq!(probe.probe(port).await, ProbeResult::success(200));
    }

    #[tokio::test]
    async fn test_probe_server_error() {
        let port = serve(Router::new().route(
            "/status.json",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let probe = HttpStatusProbe::new(Duration::from_secs(3)).unwrap();
        let result = probe.probe(port).await;
        assert!(!result.ok);
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_probe_nothing_listening() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = HttpStatusProbe::new(Duration::from_secs(3)).unwrap();
        let result = probe.probe(port).await;
        assert!(!result.ok);
        assert!(result.status_code.is_none());
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let port = serve(Router::new().route(
            "/status.json",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let probe = HttpStatusProbe::new(Duration::from_millis(200)).unwrap();
        let result = probe.probe(port).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("timed out"));
    }
}
