/**
 * FLEET SCAN - Détection de pannes sur la flotte de relais
 *
 * RÔLE :
 * Évalue le dernier heartbeat de chaque nœud contre le timeout de staleness
 * et les seuils (température, flux), puis ouvre ou résout les alertes.
 *
 * FONCTIONNEMENT :
 * - Heartbeat trop vieux → nœud offline + alerte node_offline (critical)
 * - stream_connected = false → alerte stream_disconnected (warning)
 * - cpu_temp >= seuil critique → alerte overheating (critical)
 * - Condition disparue → alerte résolue pour CE nœud uniquement
 * - Purge des heartbeats hors rétention à chaque passage
 *
 * UTILITÉ :
 * 🎯 Commande `scan` et boucle daemon
 * 🎯 Tableau de santé par nœud avec la liste des problèmes
 */

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::models::{
    Heartbeat, NodeStatus, RelayNode, Severity, TransmitterType, ALERT_NODE_OFFLINE,
    ALERT_OVERHEATING, ALERT_STREAM_DISCONNECTED,
};
use crate::store::{FleetError, FleetRepository};

pub const LAST_SCAN_KEY: &str = "last_scan_timestamp";

/// Classification d'un nœud pour le tableau de scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    New,
    Online,
    Degraded,
    Offline,
    NoData,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::New => "new",
            ScanStatus::Online => "online",
            ScanStatus::Degraded => "degraded",
            ScanStatus::Offline => "offline",
            ScanStatus::NoData => "no_data",
        }
    }
}

impl From<NodeStatus> for ScanStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::New => ScanStatus::New,
            NodeStatus::Online => ScanStatus::Online,
            NodeStatus::Degraded => ScanStatus::Degraded,
            NodeStatus::Offline => ScanStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub name: String,
    pub market: String,
    pub fm_frequency: Option<f64>,
    pub transmitter_type: TransmitterType,
    pub ip_address: Option<String>,
    pub status: ScanStatus,
    pub issues: Vec<String>,
    pub heartbeat_age_seconds: Option<i64>,
    pub heartbeat: Option<Heartbeat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    #[serde(with = "time::serde::rfc3339")]
    pub scanned_at: OffsetDateTime,
    pub nodes: Vec<NodeHealth>,
    pub pruned_heartbeats: usize,
}

impl ScanReport {
    /// Une ligne par nœud : `nom: statut | problèmes`
    pub fn render(&self) -> String {
        if self.nodes.is_empty() {
            return "No nodes registered.".to_string();
        }
        self.nodes
            .iter()
            .map(|n| {
                let issues = if n.issues.is_empty() {
                    "healthy".to_string()
                } else {
                    n.issues.join(", ")
                };
                format!("  {:<24} {:<9} {}", n.name, n.status.as_str(), issues)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Santé d'un nœud d'après son dernier heartbeat, sans effet de bord
pub fn assess_node(
    node: &RelayNode,
    heartbeat: Option<&Heartbeat>,
    config: &FleetConfig,
    now: OffsetDateTime,
) -> NodeHealth {
    let mut health = NodeHealth {
        node_id: node.node_id.clone(),
        name: node.name.clone(),
        market: node.market.clone(),
        fm_frequency: node.fm_frequency,
        transmitter_type: node.transmitter_type,
        ip_address: node.ip_address.clone(),
        status: node.status.into(),
        issues: Vec::new(),
        heartbeat_age_seconds: None,
        heartbeat: heartbeat.cloned(),
    };

    let Some(hb) = heartbeat else {
        health.status = ScanStatus::NoData;
        health.issues.push("No heartbeats received".into());
        return health;
    };

    let age = now - hb.timestamp;
    let age_secs = age.whole_seconds();
    health.heartbeat_age_seconds = Some(age_secs);
    if age > config.heartbeat_timeout() {
        health.status = ScanStatus::Offline;
        health.issues.push(format!(
            "No heartbeat for {}s (timeout: {}s)",
            age_secs, config.heartbeat_timeout_seconds
        ));
    } else if age > config.heartbeat_warning() {
        health.status = ScanStatus::Degraded;
        health.issues.push(format!("Heartbeat delayed: {}s", age_secs));
    }

    if !hb.stream_connected {
        health.issues.push("Stream disconnected".into());
        if health.status == ScanStatus::Online {
            health.status = ScanStatus::Degraded;
        }
    }
    if !hb.fm_transmitting {
        health.issues.push("FM not transmitting".into());
    }

    let thresholds = &config.alert_thresholds;
    if let Some(temp) = hb.cpu_temp {
        if temp >= thresholds.cpu_temp_critical {
            health.issues.push(format!("CPU temp critical: {:.1}°C", temp));
        } else if temp >= thresholds.cpu_temp_warning {
            health.issues.push(format!("CPU temp warning: {:.1}°C", temp));
        }
    }
    if let Some(memory) = hb.memory_usage {
        if memory >= thresholds.memory_warning {
            health.issues.push(format!("Memory usage high: {:.1}%", memory));
        }
    }
    if let Some(buffer) = hb.buffer_health {
        if buffer < thresholds.buffer_health_min {
            health.issues.push(format!("Buffer health low: {:.2}", buffer));
        }
    }

    health
}

/// Passage de scan complet à l'instant `now`
pub fn scan_at<R: FleetRepository + ?Sized>(
    repo: &R,
    config: &FleetConfig,
    now: OffsetDateTime,
) -> Result<ScanReport, FleetError> {
    let nodes = repo.list_nodes()?;
    if nodes.is_empty() {
        info!("No nodes registered.");
    }

    let mut results = Vec::with_capacity(nodes.len());
    for node in nodes {
        let id = node.node_id.as_str();
        let latest = repo.latest_heartbeat(id)?;

        match &latest {
            Some(hb) => {
                let age = now - hb.timestamp;
                if age > config.heartbeat_timeout() {
                    repo.update_node_status(id, NodeStatus::Offline, None)?;
                    repo.create_alert(
                        ALERT_NODE_OFFLINE,
                        Severity::Critical,
                        &format!(
                            "Node {} ({}) offline: no heartbeat for {}s",
                            node.name,
                            id,
                            age.whole_seconds()
                        ),
                        Some(id),
                    )?;
                } else {
                    repo.resolve_alerts_by_type(ALERT_NODE_OFFLINE, Some(id))?;
                }

                if !hb.stream_connected {
                    repo.create_alert(
                        ALERT_STREAM_DISCONNECTED,
                        Severity::Warning,
                        &format!("Node {} ({}): stream disconnected", node.name, id),
                        Some(id),
                    )?;
                } else {
                    repo.resolve_alerts_by_type(ALERT_STREAM_DISCONNECTED, Some(id))?;
                }

                match hb.cpu_temp {
                    Some(temp) if temp >= config.alert_thresholds.cpu_temp_critical => {
                        repo.create_alert(
                            ALERT_OVERHEATING,
                            Severity::Critical,
                            &format!("Node {} ({}): CPU temp {:.1}°C", node.name, id, temp),
                            Some(id),
                        )?;
                    }
                    _ => {
                        repo.resolve_alerts_by_type(ALERT_OVERHEATING, Some(id))?;
                    }
                }
            }
            None => {
                // Nœud censé être en ligne mais sans aucun heartbeat
                if !matches!(node.status, NodeStatus::New | NodeStatus::Offline) {
                    repo.create_alert(
                        ALERT_NODE_OFFLINE,
                        Severity::Warning,
                        &format!("Node {} ({}): no heartbeats received", node.name, id),
                        Some(id),
                    )?;
                }
            }
        }

        let current = repo.get_node(id)?.unwrap_or_else(|| node.clone());
        results.push(assess_node(&current, latest.as_ref(), config, now));
    }

    // Purge après évaluation : un heartbeat expiré déclenche d'abord son alerte
    let pruned = repo.prune_heartbeats(now - config.heartbeat_retention())?;
    if pruned > 0 {
        debug!("Pruned {} heartbeats older than {}h", pruned, config.heartbeat_retention_hours);
    }

    if let Ok(stamp) = now.format(&Rfc3339) {
        repo.set_state(LAST_SCAN_KEY, &stamp)?;
    }
    info!("Scanned {} nodes", results.len());

    Ok(ScanReport {
        scanned_at: now,
        nodes: results,
        pruned_heartbeats: pruned,
    })
}

/// Scan à l'heure courante
pub fn scan<R: FleetRepository + ?Sized>(repo: &R, config: &FleetConfig) -> Result<ScanReport, FleetError> {
    scan_at(repo, config, OffsetDateTime::now_utc())
}
