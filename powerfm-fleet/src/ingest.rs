use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

use crate::models::{HeartbeatIn, NodeRegistration, RelayNode};
use crate::store::{FleetError, FleetRepository};

pub type SharedRepository = Arc<dyn FleetRepository>;

// Points d'entrée communs HTTP / MQTT

/// Enregistre un heartbeat horodaté à la réception
pub fn apply_heartbeat(
    repo: &dyn FleetRepository,
    msg: HeartbeatIn,
    peer_ip: Option<String>,
) -> Result<(), FleetError> {
    let ip = msg.ip_address.clone().or(peer_ip);
    let heartbeat = msg.into_heartbeat(OffsetDateTime::now_utc());
    debug!(
        "Heartbeat from {} (status {}, stream {}, fm {})",
        heartbeat.node_id, heartbeat.status, heartbeat.stream_connected, heartbeat.fm_transmitting
    );
    repo.record_heartbeat(heartbeat, ip)
}

pub fn apply_registration(repo: &dyn FleetRepository, registration: NodeRegistration) -> Result<RelayNode, FleetError> {
    repo.upsert_node(registration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeStatus;
    use crate::store::tests::temp_store;

    #[test]
    fn test_relay_payloads_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        let registration: NodeRegistration = serde_json::from_str(
            r#"{"node_id": "la-01", "name": "LA", "market": "Los Angeles",
                "stream_url": "http://icecast/la", "fm_frequency": 92.3,
                "transmitter_type": "simulated", "version": "1.0.0",
                "timestamp": "2026-10-18T12:00:00Z"}"#,
        )
        .unwrap();
        apply_registration(&store, registration).unwrap();

        let heartbeat: HeartbeatIn = serde_json::from_str(
            r#"{"node_id": "la-01", "timestamp": "2026-10-18T12:00:05Z", "status": "ok",
                "stream_connected": true, "fm_transmitting": true, "cpu_temp": 48.2,
                "cpu_usage": 12.0, "memory_usage": 33.0, "uptime_seconds": 65,
                "buffer_health": 1.0, "audio_level": 0.31, "errors": []}"#,
        )
        .unwrap();
        apply_heartbeat(&store, heartbeat, Some("192.168.1.40".into())).unwrap();

        let node = store.get_node("la-01").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.ip_address.as_deref(), Some("192.168.1.40"));
        assert_eq!(store.latest_heartbeat("la-01").unwrap().unwrap().uptime_seconds, 65);
    }
}
