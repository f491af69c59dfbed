use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// Types d'alertes émises par le scan
pub const ALERT_NODE_OFFLINE: &str = "node_offline";
pub const ALERT_STREAM_DISCONNECTED: &str = "stream_disconnected";
pub const ALERT_OVERHEATING: &str = "overheating";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    New,
    Online,
    Degraded,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::New => "new",
            NodeStatus::Online => "online",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Offline => "offline",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(NodeStatus::New),
            "online" => Ok(NodeStatus::Online),
            "degraded" => Ok(NodeStatus::Degraded),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitterType {
    #[default]
    Simulated,
    #[serde(alias = "rpitx")]
    GpioRadio,
    #[serde(alias = "si4713")]
    I2cRadio,
}

impl TransmitterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitterType::Simulated => "simulated",
            TransmitterType::GpioRadio => "gpio_radio",
            TransmitterType::I2cRadio => "i2c_radio",
        }
    }
}

impl fmt::Display for TransmitterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransmitterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(TransmitterType::Simulated),
            "gpio_radio" | "rpitx" => Ok(TransmitterType::GpioRadio),
            "i2c_radio" | "si4713" => Ok(TransmitterType::I2cRadio),
            other => Err(format!("unknown transmitter type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Nœud relais enregistré dans la flotte
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNode {
    pub node_id: String,
    pub name: String,
    pub market: String,
    pub stream_url: Option<String>,
    pub fm_frequency: Option<f64>,
    pub transmitter_type: TransmitterType,
    pub status: NodeStatus,
    pub ip_address: Option<String>,
    pub hardware: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Champs fournis à l'enregistrement d'un nœud (CLI add-node ou self-registration)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub name: String,
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub fm_frequency: Option<f64>,
    #[serde(default)]
    pub transmitter_type: TransmitterType,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_market() -> String {
    "national".to_string()
}

/// Snapshot immuable reçu d'un relais
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: String,
    pub stream_connected: bool,
    pub fm_transmitting: bool,
    pub cpu_temp: Option<f32>,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    pub uptime_seconds: u64,
    pub buffer_health: Option<f32>,
    pub audio_level: Option<f32>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Heartbeat entrant (HTTP ou MQTT powerfm/relays/heartbeat@v1).
/// L'horodatage enregistré est celui de réception.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatIn {
    pub node_id: String,
    #[serde(default = "default_hb_status")]
    pub status: String,
    #[serde(default)]
    pub stream_connected: bool,
    #[serde(default)]
    pub fm_transmitting: bool,
    pub cpu_temp: Option<f32>,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    #[serde(default)]
    pub uptime_seconds: u64,
    pub buffer_health: Option<f32>,
    pub audio_level: Option<f32>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

fn default_hb_status() -> String {
    "ok".to_string()
}

impl HeartbeatIn {
    pub fn into_heartbeat(self, received_at: OffsetDateTime) -> Heartbeat {
        Heartbeat {
            node_id: self.node_id,
            timestamp: received_at,
            status: self.status,
            stream_connected: self.stream_connected,
            fm_transmitting: self.fm_transmitting,
            cpu_temp: self.cpu_temp,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            uptime_seconds: self.uptime_seconds,
            buffer_health: self.buffer_health,
            audio_level: self.audio_level,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub node_id: Option<String>,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetStats {
    pub total_nodes: usize,
    pub nodes_new: usize,
    pub nodes_online: usize,
    pub nodes_degraded: usize,
    pub nodes_offline: usize,
    /// Nœuds dont le dernier heartbeat indique fm_transmitting
    pub nodes_transmitting: usize,
    pub markets: usize,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub warning_alerts: usize,
}
