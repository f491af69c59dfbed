/**
 * FLEET STORE - Registre persistant des nœuds, heartbeats et alertes
 *
 * RÔLE :
 * Source de vérité de la flotte : identité des relais, historique des
 * heartbeats, cycle de vie des alertes (ouverte → résolue).
 *
 * FONCTIONNEMENT :
 * - FleetRepository trait = interface commune (nœuds, heartbeats, alertes, état agent)
 * - SqliteFleetStore = base SQLite (WAL + busy_timeout), partagée entre le daemon et la CLI
 * - Chaque mutation = une transaction IMMEDIATE : tout ou rien, jamais d'état à moitié écrit
 * - Idempotence : au plus UNE alerte ouverte par (type, nœud), vérifiée dans la transaction
 *
 * UTILITÉ :
 * 🎯 Scan : staleness et seuils → création/résolution d'alertes
 * 🎯 Ingestion : HTTP et MQTT insèrent les heartbeats ici
 * 🎯 Opérateur : add-node / remove-node pendant que le daemon tourne
 */

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::models::{
    Alert, FleetStats, Heartbeat, NodeRegistration, NodeStatus, RelayNode, Severity,
};

/// Erreurs possibles lors des opérations sur le registre
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Alert not found: {0}")]
    AlertNotFound(u64),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interface commune du registre de flotte
pub trait FleetRepository: Send + Sync {
    /// Crée ou met à jour un nœud ; le statut d'un nœud existant est conservé
    fn upsert_node(&self, registration: NodeRegistration) -> Result<RelayNode, FleetError>;
    fn get_node(&self, node_id: &str) -> Result<Option<RelayNode>, FleetError>;
    /// Triés par marché puis par nom
    fn list_nodes(&self) -> Result<Vec<RelayNode>, FleetError>;
    /// Supprime le nœud avec ses heartbeats et ses alertes
    fn remove_node(&self, node_id: &str) -> Result<RelayNode, FleetError>;
    fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        ip_address: Option<String>,
    ) -> Result<(), FleetError>;

    /// Ajoute un heartbeat ; `ok` → online, sinon degraded
    fn record_heartbeat(&self, heartbeat: Heartbeat, ip_address: Option<String>) -> Result<(), FleetError>;
    fn latest_heartbeat(&self, node_id: &str) -> Result<Option<Heartbeat>, FleetError>;
    /// Plus récents d'abord
    fn heartbeat_history(&self, node_id: &str, since: OffsetDateTime) -> Result<Vec<Heartbeat>, FleetError>;
    /// Supprime les heartbeats antérieurs à `before`
    fn prune_heartbeats(&self, before: OffsetDateTime) -> Result<usize, FleetError>;

    /// Idempotent : renvoie l'id de l'alerte ouverte existante pour (type, nœud)
    fn create_alert(
        &self,
        alert_type: &str,
        severity: Severity,
        message: &str,
        node_id: Option<&str>,
    ) -> Result<u64, FleetError>;
    fn find_open_alert(&self, alert_type: &str, node_id: Option<&str>) -> Result<Option<Alert>, FleetError>;
    fn resolve_alert(&self, alert_id: u64) -> Result<(), FleetError>;
    /// `Some(node)` : alertes de ce nœud uniquement ; `None` : toute la flotte
    fn resolve_alerts_by_type(&self, alert_type: &str, node_id: Option<&str>) -> Result<usize, FleetError>;
    /// Alertes ouvertes, les plus graves d'abord
    fn active_alerts(&self, severity: Option<Severity>) -> Result<Vec<Alert>, FleetError>;
    /// Alertes les plus récentes, ouvertes ou résolues
    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, FleetError>;

    fn fleet_stats(&self) -> Result<FleetStats, FleetError>;

    fn get_state(&self, key: &str) -> Result<Option<String>, FleetError>;
    fn set_state(&self, key: &str, value: &str) -> Result<(), FleetError>;
}

// Horodatages en nanosecondes Unix (ordre SQL = ordre chronologique)
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    market TEXT NOT NULL,
    stream_url TEXT,
    fm_frequency REAL,
    transmitter_type TEXT NOT NULL,
    status TEXT NOT NULL,
    ip_address TEXT,
    hardware TEXT,
    notes TEXT,
    last_heartbeat INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS heartbeats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL,
    stream_connected INTEGER NOT NULL,
    fm_transmitting INTEGER NOT NULL,
    cpu_temp REAL,
    cpu_usage REAL,
    memory_usage REAL,
    uptime_seconds INTEGER NOT NULL,
    buffer_health REAL,
    audio_level REAL,
    errors TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_heartbeats_node_time ON heartbeats(node_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_heartbeats_time ON heartbeats(timestamp);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT REFERENCES nodes(node_id) ON DELETE CASCADE,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_alerts_open ON alerts(alert_type, node_id) WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS agent_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Attente max du verrou d'écriture tenu par un autre processus
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const NODE_COLUMNS: &str = "node_id, name, market, stream_url, fm_frequency, transmitter_type, \
     status, ip_address, hardware, notes, last_heartbeat, created_at, updated_at";
const HEARTBEAT_COLUMNS: &str = "node_id, timestamp, status, stream_connected, fm_transmitting, \
     cpu_temp, cpu_usage, memory_usage, uptime_seconds, buffer_health, audio_level, errors";
const ALERT_COLUMNS: &str = "id, node_id, alert_type, severity, message, created_at, resolved_at";

fn bad_column(
    idx: usize,
    ty: Type,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn to_nanos(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos() as i64
}

fn from_nanos(idx: usize, nanos: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|e| bad_column(idx, Type::Integer, e))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    from_nanos(idx, row.get(idx)?)
}

fn opt_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|nanos| from_nanos(idx, nanos))
        .transpose()
}

fn parsed_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| bad_column(idx, Type::Text, e))
}

fn opt_f32_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f32>> {
    Ok(row.get::<_, Option<f64>>(idx)?.map(|v| v as f32))
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<RelayNode> {
    Ok(RelayNode {
        node_id: row.get(0)?,
        name: row.get(1)?,
        market: row.get(2)?,
        stream_url: row.get(3)?,
        fm_frequency: row.get(4)?,
        transmitter_type: parsed_at(row, 5)?,
        status: parsed_at(row, 6)?,
        ip_address: row.get(7)?,
        hardware: row.get(8)?,
        notes: row.get(9)?,
        last_heartbeat: opt_timestamp_at(row, 10)?,
        created_at: timestamp_at(row, 11)?,
        updated_at: timestamp_at(row, 12)?,
    })
}

fn heartbeat_from_row(row: &Row<'_>) -> rusqlite::Result<Heartbeat> {
    let errors: String = row.get(11)?;
    Ok(Heartbeat {
        node_id: row.get(0)?,
        timestamp: timestamp_at(row, 1)?,
        status: row.get(2)?,
        stream_connected: row.get(3)?,
        fm_transmitting: row.get(4)?,
        cpu_temp: opt_f32_at(row, 5)?,
        cpu_usage: opt_f32_at(row, 6)?,
        memory_usage: opt_f32_at(row, 7)?,
        uptime_seconds: row.get::<_, i64>(8)?.max(0) as u64,
        buffer_health: opt_f32_at(row, 9)?,
        audio_level: opt_f32_at(row, 10)?,
        errors: serde_json::from_str(&errors).map_err(|e| bad_column(11, Type::Text, e))?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get::<_, i64>(0)? as u64,
        node_id: row.get(1)?,
        alert_type: row.get(2)?,
        severity: parsed_at(row, 3)?,
        message: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
        resolved_at: opt_timestamp_at(row, 6)?,
    })
}

fn node_status(tx: &Transaction<'_>, node_id: &str) -> Result<NodeStatus, FleetError> {
    let status: Option<String> = tx
        .query_row("SELECT status FROM nodes WHERE node_id = ?1", params![node_id], |r| r.get(0))
        .optional()?;
    let status = status.ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
    status.parse().map_err(|e: String| FleetError::Database(bad_column(0, Type::Text, e)))
}

fn log_transition(node_id: &str, from: NodeStatus, to: NodeStatus) {
    if from != to {
        info!("Node {}: {} → {}", node_id, from.as_str(), to.as_str());
    }
}

/// Registre SQLite partagé par le daemon et les commandes CLI
pub struct SqliteFleetStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteFleetStore {
    /// Ouvre (ou crée) la base et son schéma
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, FleetError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        // WAL : lecteurs jamais bloqués par l'écrivain (daemon + CLI)
        let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        if !journal.eq_ignore_ascii_case("wal") {
            warn!("Fleet store journal mode is {}, not WAL", journal);
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        info!("Fleet store opened at {} ({} nodes)", path.display(), nodes);
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transaction IMMEDIATE : verrou d'écriture pris avant la première lecture,
    /// rollback si `f` échoue
    fn write<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R, FleetError>) -> Result<R, FleetError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl FleetRepository for SqliteFleetStore {
    fn upsert_node(&self, registration: NodeRegistration) -> Result<RelayNode, FleetError> {
        let now = OffsetDateTime::now_utc();
        let (node, created) = self.write(|tx| {
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM nodes WHERE node_id = ?1", NODE_COLUMNS),
                    params![registration.node_id],
                    node_from_row,
                )
                .optional()?;

            match existing {
                Some(mut node) => {
                    node.name = registration.name;
                    node.market = registration.market;
                    node.stream_url = registration.stream_url.or(node.stream_url.take());
                    node.fm_frequency = registration.fm_frequency.or(node.fm_frequency);
                    node.transmitter_type = registration.transmitter_type;
                    node.hardware = registration.hardware.or(node.hardware.take());
                    node.notes = registration.notes.or(node.notes.take());
                    node.updated_at = now;
                    tx.execute(
                        "UPDATE nodes SET name = ?2, market = ?3, stream_url = ?4, fm_frequency = ?5,
                             transmitter_type = ?6, hardware = ?7, notes = ?8, updated_at = ?9
                         WHERE node_id = ?1",
                        params![
                            node.node_id,
                            node.name,
                            node.market,
                            node.stream_url,
                            node.fm_frequency,
                            node.transmitter_type.as_str(),
                            node.hardware,
                            node.notes,
                            to_nanos(now),
                        ],
                    )?;
                    Ok((node, false))
                }
                None => {
                    let node = RelayNode {
                        node_id: registration.node_id,
                        name: registration.name,
                        market: registration.market,
                        stream_url: registration.stream_url,
                        fm_frequency: registration.fm_frequency,
                        transmitter_type: registration.transmitter_type,
                        status: NodeStatus::New,
                        ip_address: None,
                        hardware: registration.hardware,
                        notes: registration.notes,
                        last_heartbeat: None,
                        created_at: now,
                        updated_at: now,
                    };
                    tx.execute(
                        &format!(
                            "INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                            NODE_COLUMNS
                        ),
                        params![
                            node.node_id,
                            node.name,
                            node.market,
                            node.stream_url,
                            node.fm_frequency,
                            node.transmitter_type.as_str(),
                            node.status.as_str(),
                            node.ip_address,
                            node.hardware,
                            node.notes,
                            Option::<i64>::None,
                            to_nanos(now),
                            to_nanos(now),
                        ],
                    )?;
                    Ok((node, true))
                }
            }
        })?;
        if created {
            info!("Registered node {} ({})", node.node_id, node.name);
        }
        Ok(node)
    }

    fn get_node(&self, node_id: &str) -> Result<Option<RelayNode>, FleetError> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE node_id = ?1", NODE_COLUMNS),
                params![node_id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    fn list_nodes(&self) -> Result<Vec<RelayNode>, FleetError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY market, name",
            NODE_COLUMNS
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn remove_node(&self, node_id: &str) -> Result<RelayNode, FleetError> {
        let node = self.write(|tx| {
            let node = tx
                .query_row(
                    &format!("SELECT {} FROM nodes WHERE node_id = ?1", NODE_COLUMNS),
                    params![node_id],
                    node_from_row,
                )
                .optional()?
                .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
            // Heartbeats et alertes : ON DELETE CASCADE
            tx.execute("DELETE FROM nodes WHERE node_id = ?1", params![node_id])?;
            Ok(node)
        })?;
        info!("Removed node {} with its heartbeats and alerts", node_id);
        Ok(node)
    }

    fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        ip_address: Option<String>,
    ) -> Result<(), FleetError> {
        let previous = self.write(|tx| {
            let previous = node_status(tx, node_id)?;
            tx.execute(
                "UPDATE nodes SET status = ?2, ip_address = COALESCE(?3, ip_address), updated_at = ?4
                 WHERE node_id = ?1",
                params![node_id, status.as_str(), ip_address, to_nanos(OffsetDateTime::now_utc())],
            )?;
            Ok(previous)
        })?;
        log_transition(node_id, previous, status);
        Ok(())
    }

    fn record_heartbeat(&self, heartbeat: Heartbeat, ip_address: Option<String>) -> Result<(), FleetError> {
        let status = if heartbeat.status == "ok" {
            NodeStatus::Online
        } else {
            NodeStatus::Degraded
        };
        let errors = serde_json::to_string(&heartbeat.errors)?;

        let previous = self.write(|tx| {
            let previous = node_status(tx, &heartbeat.node_id)?;
            tx.execute(
                "UPDATE nodes SET status = ?2, last_heartbeat = ?3,
                     ip_address = COALESCE(?4, ip_address), updated_at = ?5
                 WHERE node_id = ?1",
                params![
                    heartbeat.node_id,
                    status.as_str(),
                    to_nanos(heartbeat.timestamp),
                    ip_address,
                    to_nanos(OffsetDateTime::now_utc()),
                ],
            )?;
            tx.execute(
                &format!(
                    "INSERT INTO heartbeats ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    HEARTBEAT_COLUMNS
                ),
                params![
                    heartbeat.node_id,
                    to_nanos(heartbeat.timestamp),
                    heartbeat.status,
                    heartbeat.stream_connected,
                    heartbeat.fm_transmitting,
                    heartbeat.cpu_temp.map(f64::from),
                    heartbeat.cpu_usage.map(f64::from),
                    heartbeat.memory_usage.map(f64::from),
                    i64::try_from(heartbeat.uptime_seconds).unwrap_or(i64::MAX),
                    heartbeat.buffer_health.map(f64::from),
                    heartbeat.audio_level.map(f64::from),
                    errors,
                ],
            )?;
            Ok(previous)
        })?;
        log_transition(&heartbeat.node_id, previous, status);
        Ok(())
    }

    fn latest_heartbeat(&self, node_id: &str) -> Result<Option<Heartbeat>, FleetError> {
        let conn = self.conn.lock();
        let heartbeat = conn
            .query_row(
                &format!(
                    "SELECT {} FROM heartbeats WHERE node_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                    HEARTBEAT_COLUMNS
                ),
                params![node_id],
                heartbeat_from_row,
            )
            .optional()?;
        Ok(heartbeat)
    }

    fn heartbeat_history(&self, node_id: &str, since: OffsetDateTime) -> Result<Vec<Heartbeat>, FleetError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM heartbeats WHERE node_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC, id DESC",
            HEARTBEAT_COLUMNS
        ))?;
        let history = stmt
            .query_map(params![node_id, to_nanos(since)], heartbeat_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }

    fn prune_heartbeats(&self, before: OffsetDateTime) -> Result<usize, FleetError> {
        self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM heartbeats WHERE timestamp < ?1",
                params![to_nanos(before)],
            )?)
        })
    }

    fn create_alert(
        &self,
        alert_type: &str,
        severity: Severity,
        message: &str,
        node_id: Option<&str>,
    ) -> Result<u64, FleetError> {
        let now = OffsetDateTime::now_utc();
        let (id, created) = self.write(|tx| {
            if let Some(node_id) = node_id {
                node_status(tx, node_id)?;
            }
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM alerts
                     WHERE resolved_at IS NULL AND alert_type = ?1 AND node_id IS ?2
                     ORDER BY id LIMIT 1",
                    params![alert_type, node_id],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok((id as u64, false));
            }
            tx.execute(
                "INSERT INTO alerts (node_id, alert_type, severity, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![node_id, alert_type, severity.as_str(), message, to_nanos(now)],
            )?;
            Ok((tx.last_insert_rowid() as u64, true))
        })?;

        if created {
            match severity {
                Severity::Critical => warn!("🚨 Alert #{} [{}] {}", id, severity.as_str(), message),
                _ => info!("Alert #{} [{}] {}", id, severity.as_str(), message),
            }
        }
        Ok(id)
    }

    fn find_open_alert(&self, alert_type: &str, node_id: Option<&str>) -> Result<Option<Alert>, FleetError> {
        let conn = self.conn.lock();
        let alert = conn
            .query_row(
                &format!(
                    "SELECT {} FROM alerts
                     WHERE resolved_at IS NULL AND alert_type = ?1 AND node_id IS ?2
                     ORDER BY id LIMIT 1",
                    ALERT_COLUMNS
                ),
                params![alert_type, node_id],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    fn resolve_alert(&self, alert_id: u64) -> Result<(), FleetError> {
        let resolved_type = self.write(|tx| {
            let found: Option<(String, Option<i64>)> = tx
                .query_row(
                    "SELECT alert_type, resolved_at FROM alerts WHERE id = ?1",
                    params![alert_id as i64],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let (alert_type, resolved_at) = found.ok_or(FleetError::AlertNotFound(alert_id))?;
            if resolved_at.is_some() {
                return Ok(None);
            }
            tx.execute(
                "UPDATE alerts SET resolved_at = ?2 WHERE id = ?1",
                params![alert_id as i64, to_nanos(OffsetDateTime::now_utc())],
            )?;
            Ok(Some(alert_type))
        })?;
        if let Some(alert_type) = resolved_type {
            info!("✅ Alert #{} resolved ({})", alert_id, alert_type);
        }
        Ok(())
    }

    fn resolve_alerts_by_type(&self, alert_type: &str, node_id: Option<&str>) -> Result<usize, FleetError> {
        let resolved = self.write(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, node_id FROM alerts
                 WHERE resolved_at IS NULL AND alert_type = ?1 AND (?2 IS NULL OR node_id = ?2)",
            )?;
            let open = stmt
                .query_map(params![alert_type, node_id], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            if !open.is_empty() {
                tx.execute(
                    "UPDATE alerts SET resolved_at = ?3
                     WHERE resolved_at IS NULL AND alert_type = ?1 AND (?2 IS NULL OR node_id = ?2)",
                    params![alert_type, node_id, to_nanos(OffsetDateTime::now_utc())],
                )?;
            }
            Ok(open)
        })?;

        for (id, node) in &resolved {
            info!(
                "✅ Alert #{} resolved ({} on {})",
                id,
                alert_type,
                node.as_deref().unwrap_or("fleet")
            );
        }
        Ok(resolved.len())
    }

    fn active_alerts(&self, severity: Option<Severity>) -> Result<Vec<Alert>, FleetError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE resolved_at IS NULL AND (?1 IS NULL OR severity = ?1)",
            ALERT_COLUMNS
        ))?;
        let mut alerts = stmt
            .query_map(params![severity.map(|s| s.as_str())], alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| b.created_at.cmp(&a.created_at)));
        Ok(alerts)
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, FleetError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts ORDER BY created_at DESC, id DESC LIMIT ?1",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    fn fleet_stats(&self) -> Result<FleetStats, FleetError> {
        let conn = self.conn.lock();
        let mut stats = FleetStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM nodes GROUP BY status")?;
        let by_status = stmt
            .query_map([], |r| Ok((parsed_at::<NodeStatus>(r, 0)?, r.get::<_, i64>(1)? as usize)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in by_status {
            stats.total_nodes += count;
            match status {
                NodeStatus::New => stats.nodes_new += count,
                NodeStatus::Online => stats.nodes_online += count,
                NodeStatus::Degraded => stats.nodes_degraded += count,
                NodeStatus::Offline => stats.nodes_offline += count,
            }
        }

        stats.markets = conn.query_row("SELECT COUNT(DISTINCT market) FROM nodes", [], |r| {
            r.get::<_, i64>(0)
        })? as usize;

        // Émetteurs actifs : d'après le DERNIER heartbeat de chaque nœud
        stats.nodes_transmitting = conn.query_row(
            "SELECT COUNT(*) FROM nodes n
             WHERE (SELECT h.fm_transmitting FROM heartbeats h WHERE h.node_id = n.node_id
                    ORDER BY h.timestamp DESC, h.id DESC LIMIT 1) = 1",
            [],
            |r| r.get::<_, i64>(0),
        )? as usize;

        let mut stmt =
            conn.prepare("SELECT severity, COUNT(*) FROM alerts WHERE resolved_at IS NULL GROUP BY severity")?;
        let by_severity = stmt
            .query_map([], |r| Ok((parsed_at::<Severity>(r, 0)?, r.get::<_, i64>(1)? as usize)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (severity, count) in by_severity {
            stats.active_alerts += count;
            match severity {
                Severity::Critical => stats.critical_alerts += count,
                Severity::Warning => stats.warning_alerts += count,
                Severity::Info => {}
            }
        }
        Ok(stats)
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, FleetError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM agent_state WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), FleetError> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, to_nanos(OffsetDateTime::now_utc())],
            )?;
            Ok(())
        })
    }
}
