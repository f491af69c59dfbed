use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::store::FleetError;

pub const CONFIG_ENV_VAR: &str = "POWERFM_FLEET_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "fleet.config.json";
/// Un an d'historique au maximum
pub const MAX_RETENTION_HOURS: i64 = 24 * 366;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub data_file: PathBuf,
    pub heartbeat_timeout_seconds: i64,
    pub heartbeat_warning_seconds: i64,
    /// Intervalle du scan en mode daemon
    pub poll_interval: u64,
    pub heartbeat_retention_hours: i64,
    /// Rapport imprimé tous les N cycles en mode daemon
    pub report_every_cycles: u64,
    pub alert_thresholds: AlertThresholds,
    pub http_bind: String,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_temp_warning: f32,
    pub cpu_temp_critical: f32,
    pub memory_warning: f32,
    pub buffer_health_min: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data/fleet.db"),
            heartbeat_timeout_seconds: 180,
            heartbeat_warning_seconds: 120,
            poll_interval: 60,
            heartbeat_retention_hours: 24,
            report_every_cycles: 30,
            alert_thresholds: AlertThresholds::default(),
            http_bind: "0.0.0.0:8090".into(),
            mqtt: None,
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_temp_warning: 70.0,
            cpu_temp_critical: 80.0,
            memory_warning: 85.0,
            buffer_health_min: 0.5,
        }
    }
}

impl FleetConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.heartbeat_timeout_seconds)
    }

    pub fn heartbeat_warning(&self) -> Duration {
        Duration::seconds(self.heartbeat_warning_seconds)
    }

    pub fn heartbeat_retention(&self) -> Duration {
        Duration::hours(self.heartbeat_retention_hours)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.heartbeat_timeout_seconds <= 0 || self.heartbeat_warning_seconds <= 0 {
            return Err(FleetError::Config("heartbeat timeouts must be positive".into()));
        }
        if self.heartbeat_warning_seconds > self.heartbeat_timeout_seconds {
            return Err(FleetError::Config(
                "heartbeat_warning_seconds must not exceed heartbeat_timeout_seconds".into(),
            ));
        }
        if self.poll_interval == 0 {
            return Err(FleetError::Config("poll_interval must be positive".into()));
        }
        // Le dernier heartbeat doit survivre à la purge jusqu'au timeout
        if self.heartbeat_retention_hours <= 0
            || self.heartbeat_retention_hours > MAX_RETENTION_HOURS
            || self.heartbeat_retention_hours * 3600 < self.heartbeat_timeout_seconds
        {
            return Err(FleetError::Config(format!(
                "heartbeat_retention_hours must cover heartbeat_timeout_seconds ({}s) and be at most {}",
                self.heartbeat_timeout_seconds, MAX_RETENTION_HOURS
            )));
        }
        Ok(())
    }
}

/// CLI flag, puis `POWERFM_FLEET_CONFIG`, puis `fleet.config.json`
pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Fichier absent → configuration par défaut ; fichier invalide → erreur
pub async fn load_config(path: &Path) -> Result<FleetConfig, FleetError> {
    if !path.exists() {
        warn!("No fleet config at {}, using defaults", path.display());
        return Ok(FleetConfig::default());
    }
    let txt = fs::read_to_string(path).await?;
    if txt.trim().is_empty() {
        return Ok(FleetConfig::default());
    }
    let config: FleetConfig = serde_json::from_str(&txt)
        .map_err(|e| FleetError::Config(format!("invalid {}: {}", path.display(), e)))?;
    config.validate()?;
    info!("Loaded fleet config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.heartbeat_timeout(), Duration::seconds(180));
    }

    #[tokio::test]
    async fn test_partial_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.config.json");
        std::fs::write(
            &path,
            r#"{"poll_interval": 15, "alert_thresholds": {"cpu_temp_critical": 75.0},
                "mqtt": {"host": "broker.local", "port": 1883}}"#,
        )
        .unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.poll_interval, 15);
        assert_eq!(config.alert_thresholds.cpu_temp_critical, 75.0);
        assert_eq!(config.alert_thresholds.cpu_temp_warning, 70.0);
        assert_eq!(config.heartbeat_timeout_seconds, 180);
        assert_eq!(config.mqtt.unwrap().host, "broker.local");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.config.json");
        std::fs::write(&path, r#"{"heartbeat_warning_seconds": 300}"#).unwrap();
        assert!(matches!(load_config(&path).await, Err(FleetError::Config(_))));

        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_config(&path).await, Err(FleetError::Config(_))));
    }

    #[test]
    fn test_retention_must_cover_timeout() {
        let mut config = FleetConfig {
            heartbeat_retention_hours: 0,
            ..FleetConfig::default()
        };
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));

        config.heartbeat_retention_hours = i64::MAX;
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));

        // 1 h de rétention < timeout de 2 h
        config.heartbeat_retention_hours = 1;
        config.heartbeat_timeout_seconds = 7200;
        config.heartbeat_warning_seconds = 120;
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));

        config.heartbeat_retention_hours = 2;
        assert!(config.validate().is_ok());
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_zero_retention_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.config.json");
        std::fs::write(&path, r#"{"heartbeat_retention_hours": 0}"#).unwrap();
        assert!(matches!(load_config(&path).await, Err(FleetError::Config(_))));
    }
}
