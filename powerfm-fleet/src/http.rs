/**
 * API REST FLEET - Ingestion des relais et lecture de l'état de la flotte
 *
 * RÔLE :
 * Reçoit les heartbeats et registrations des relais (HeartbeatSink::Http)
 * et expose l'état de la flotte aux outils opérateur.
 *
 * FONCTIONNEMENT :
 * - POST /api/transmitters/heartbeat : heartbeat (404 si nœud inconnu)
 * - POST /api/transmitters/register : création / mise à jour du nœud
 * - GET /api/fleet/stats, /api/nodes, /api/nodes/{id}, /api/alerts
 * - GET /health : toujours "ok"
 * - Accès store via spawn_blocking (SQLite bloquant)
 */

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::ingest::{apply_heartbeat, apply_registration, SharedRepository};
use crate::models::{Alert, FleetStats, HeartbeatIn, NodeRegistration, RelayNode, Severity};
use crate::scan::{assess_node, NodeHealth};
use crate::store::{FleetError, FleetRepository};

#[derive(Clone)]
pub struct AppState {
    pub repo: SharedRepository,
    pub config: Arc<FleetConfig>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(e: FleetError) -> ApiError {
    let code = match &e {
        FleetError::NodeNotFound(_) | FleetError::AlertNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Fleet store error: {}", e);
    }
    (code, Json(json!({ "ok": false, "error": e.to_string() })))
}

fn internal_error(message: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": message })),
    )
}

/// Exécute un accès store sur le pool bloquant
async fn with_repo<T, F>(app: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn FleetRepository) -> Result<T, FleetError> + Send + 'static,
{
    let repo = app.repo.clone();
    match tokio::task::spawn_blocking(move || f(repo.as_ref())).await {
        Ok(result) => result.map_err(api_error),
        Err(e) => {
            error!("Fleet store task failed: {}", e);
            Err(internal_error("store task failed"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlertParams {
    severity: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/transmitters/heartbeat", post(post_heartbeat))
        .route("/api/transmitters/register", post(post_register))
        .route("/api/fleet/stats", get(get_stats))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{id}", get(get_node))
        .route("/api/alerts", get(list_alerts))
        .with_state(app_state)
}

// POST /api/transmitters/heartbeat
async fn post_heartbeat(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(msg): Json<HeartbeatIn>,
) -> Result<Json<Value>, ApiError> {
    let peer_ip = Some(peer.ip().to_string());
    with_repo(&app, move |repo| {
        apply_heartbeat(repo, msg, peer_ip).inspect_err(|e| {
            if let FleetError::NodeNotFound(id) = e {
                warn!("Heartbeat from unregistered node {}", id);
            }
        })
    })
    .await?;
    Ok(Json(json!({ "ok": true })))
}

// POST /api/transmitters/register
async fn post_register(
    State(app): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> Result<Json<RelayNode>, ApiError> {
    with_repo(&app, move |repo| apply_registration(repo, registration))
        .await
        .map(Json)
}

// GET /api/fleet/stats
async fn get_stats(State(app): State<AppState>) -> Result<Json<FleetStats>, ApiError> {
    with_repo(&app, |repo| repo.fleet_stats()).await.map(Json)
}

// GET /api/nodes
async fn list_nodes(State(app): State<AppState>) -> Result<Json<Vec<RelayNode>>, ApiError> {
    with_repo(&app, |repo| repo.list_nodes()).await.map(Json)
}

// GET /api/nodes/{id} (santé calculée à la volée)
async fn get_node(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeHealth>, ApiError> {
    let config = app.config.clone();
    with_repo(&app, move |repo| {
        let node = repo.get_node(&id)?.ok_or_else(|| FleetError::NodeNotFound(id.clone()))?;
        let latest = repo.latest_heartbeat(&id)?;
        Ok(assess_node(&node, latest.as_ref(), &config, OffsetDateTime::now_utc()))
    })
    .await
    .map(Json)
}

// GET /api/alerts?severity=critical
async fn list_alerts(
    State(app): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let severity = match params.severity {
        Some(s) => Some(s.parse::<Severity>().map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": e })))
        })?),
        None => None,
    };
    with_repo(&app, move |repo| repo.active_alerts(severity)).await.map(Json)
}

/// Sert jusqu'à annulation
pub async fn serve(listener: TcpListener, app_state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Fleet API listening on http://{}", addr);
    }
    let app = build_router(app_state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
