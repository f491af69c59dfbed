//! Supervisor configuration: station table + check/restart policy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SupervisorError;

pub const CONFIG_ENV_VAR: &str = "POWERFM_SUPERVISOR_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "stations.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub stations: BTreeMap<String, StationConfig>,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    #[serde(default = "default_relay_binary")]
    pub relay_binary: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationConfig {
    pub name: String,
    #[serde(default)]
    pub market: Option<String>,
    /// Status endpoint port of the station's relay
    pub port: u16,
    /// Playlist path or stream URL, used when no relay config is given
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub fm_frequency: Option<f64>,
    /// Existing relay config file for this station
    #[serde(default)]
    pub relay_config: Option<PathBuf>,
    /// Extra arguments appended to the relay command line
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_check_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    3
}
fn default_max_restarts() -> usize {
    3
}
fn default_restart_window() -> u64 {
    300
}
fn default_relay_binary() -> PathBuf {
    PathBuf::from("powerfm-relay")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_state_file() -> PathBuf {
    PathBuf::from("stations.state.json")
}

impl SupervisorConfig {
    pub async fn load(path: &Path) -> Result<Self, SupervisorError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SupervisorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SupervisorError> {
        let config: SupervisorConfig = serde_json::from_str(content)
            .map_err(|e| SupervisorError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// CLI flag, then `POWERFM_SUPERVISOR_CONFIG`, then `stations.json`
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_restarts == 0 {
            return Err(SupervisorError::Config("max_restarts must be at least 1".into()));
        }
        if self.restart_window_secs == 0 {
            return Err(SupervisorError::Config("restart_window_secs must be at least 1".into()));
        }
        if self.check_interval_secs == 0 || self.probe_timeout_secs == 0 {
            return Err(SupervisorError::Config(
                "check_interval_secs and probe_timeout_secs must be positive".into(),
            ));
        }

        let mut ports: BTreeMap<u16, &str> = BTreeMap::new();
        for (key, station) in &self.stations {
            if let Some(other) = ports.insert(station.port, key) {
                return Err(SupervisorError::Config(format!(
                    "stations {} and {} share port {}",
                    other, key, station.port
                )));
            }
            if station.relay_config.is_none() && station.source.is_none() {
                return Err(SupervisorError::Config(format!(
                    "station {} needs either relay_config or source",
                    key
                )));
            }
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// `all` or a comma-separated key list, validated against the table
    pub fn resolve_keys(&self, selection: &str) -> Result<Vec<String>, SupervisorError> {
        if selection.trim() == "all" {
            return Ok(self.stations.keys().cloned().collect());
        }
        selection
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| {
                if self.stations.contains_key(k) {
                    Ok(k.to_string())
                } else {
                    Err(SupervisorError::UnknownStation(k.to_string()))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "stations": {
            "la":  { "name": "Power 106 LA", "market": "Los Angeles", "port": 8001, "source": "http://icecast.local/la" },
            "nyc": { "name": "Power 105.1 NYC", "market": "New York", "port": 8002, "source": "http://icecast.local/nyc" }
        }
    }"#;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_restarts, 3);
        assert_eq!(config.restart_window(), Duration::from_secs(300));
        assert_eq!(config.stations.len(), 2);
    }

    #[test]
    fn test_resolve_keys() {
        let config = SupervisorConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.resolve_keys("all").unwrap(), vec!["la", "nyc"]);
        assert_eq!(config.resolve_keys(" nyc ,la").unwrap(), vec!["nyc", "la"]);
        assert!(matches!(
            config.resolve_keys("la,miami"),
            Err(SupervisorError::UnknownStation(k)) if k == "miami"
        ));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let json = SAMPLE.replace("8002", "8001");
        assert!(matches!(
            SupervisorConfig::from_json(&json),
            Err(SupervisorError::Config(_))
        ));
    }

    #[test]
    fn test_zero_restart_window_rejected() {
        let json = r#"{
            "restart_window_secs": 0,
            "stations": { "la": { "name": "LA", "port": 8001, "source": "http://icecast.local/la" } }
        }"#;
        assert!(matches!(
            SupervisorConfig::from_json(json),
            Err(SupervisorError::Config(_))
        ));
    }

    #[test]
    fn test_station_without_source_rejected() {
        let json = r#"{ "stations": { "la": { "name": "LA", "port": 8001 } } }"#;
        assert!(matches!(
            SupervisorConfig::from_json(json),
            Err(SupervisorError::Config(_))
        ));
    }
}
