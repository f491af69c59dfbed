//! Relay node configuration
//!
//! Handles:
//! - Stream source and FM frequency
//! - Transmitter backend selection and options
//! - Reconnect/backoff tuning
//! - Heartbeat delivery (HTTP hub or MQTT broker)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::{PipelineConfig, SourceKind};
use crate::transmitter::{TransmitterKind, TransmitterOptions};

/// Env var consulted when no `--config` flag is given
pub const CONFIG_ENV_VAR: &str = "POWERFM_RELAY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "relay.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_market")]
    pub market: String,
    pub stream_url: String,
    /// MHz
    pub fm_frequency: f64,
    #[serde(default)]
    pub transmitter_type: TransmitterKind,
    #[serde(default)]
    pub transmitter_options: TransmitterOptions,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default)]
    pub hub_url: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_registration_interval")]
    pub registration_interval: u64,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_market() -> String {
    "unknown".to_string()
}
fn default_sample_rate() -> u32 {
    48_000
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_max_reconnect_delay() -> u64 {
    60
}
fn default_chunk_size() -> usize {
    4096
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_registration_interval() -> u64 {
    300
}
fn default_status_port() -> u16 {
    8100
}
fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}

impl RelayConfig {
    /// Load and validate a JSON config file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// CLI flag, then `POWERFM_RELAY_CONFIG`, then `relay.json`
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if !(76.0..=108.0).contains(&self.fm_frequency) {
            return Err(ConfigError::Invalid(format!(
                "fm_frequency {} MHz outside the FM band (76-108)",
                self.fm_frequency
            )));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        // s16le: chunks must hold whole samples
        if self.chunk_size < 2 || self.chunk_size % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} must be an even number of bytes",
                self.chunk_size
            )));
        }
        if self.reconnect_delay == 0 {
            return Err(ConfigError::Invalid("reconnect_delay must be at least 1s".into()));
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(ConfigError::Invalid(
                "max_reconnect_delay must be >= reconnect_delay".into(),
            ));
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval must be at least 1s".into()));
        }
        if let SourceKind::Tone {
            frequency_hz,
            duration_secs,
        } = &self.source
        {
            if !frequency_hz.is_finite() || *frequency_hz <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tone frequency_hz {} must be a positive number",
                    frequency_hz
                )));
            }
            if let Some(secs) = duration_secs {
                if !secs.is_finite() || *secs < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "tone duration_secs {} must be a finite, non-negative number",
                        secs
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.node_id)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            stream_url: self.stream_url.clone(),
            frequency: self.fm_frequency,
            sample_rate: self.sample_rate,
            chunk_size: self.chunk_size,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            max_reconnect_delay: Duration::from_secs(self.max_reconnect_delay),
            source: self.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "node_id": "la-01",
        "stream_url": "http://icecast.local:8000/powerfm",
        "fm_frequency": 88.1
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = RelayConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.reconnect_delay, 5);
        assert_eq!(config.max_reconnect_delay, 60);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.status_port, 8100);
        assert_eq!(config.transmitter_type, TransmitterKind::Simulated);
        assert_eq!(config.display_name(), "la-01");
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn test_transmitter_type_parsing() {
        let json = r#"{
            "node_id": "nyc-02",
            "stream_url": "http://x/y",
            "fm_frequency": 101.5,
            "transmitter_type": "gpio_radio",
            "transmitter_options": { "power": 3, "rds_station": "PWR FM" }
        }"#;
        let config = RelayConfig::from_json(json).unwrap();
        assert_eq!(config.transmitter_type, TransmitterKind::GpioRadio);
        assert_eq!(config.transmitter_options.power, 3);
        assert_eq!(config.transmitter_options.rds_station, "PWR FM");
    }

    #[test]
    fn test_rejects_out_of_band_frequency() {
        let json = MINIMAL.replace("88.1", "150.0");
        assert!(matches!(
            RelayConfig::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_odd_chunk_size() {
        let json = MINIMAL.replace("88.1", "88.1, \"chunk_size\": 4095");
        assert!(matches!(
            RelayConfig::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_tone_duration() {
        let json = MINIMAL.replace(
            "88.1",
            r#"88.1, "source": {"type": "tone", "duration_secs": -2.5}"#,
        );
        assert!(matches!(
            RelayConfig::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = RelayConfig::from_json(MINIMAL).unwrap();
        for secs in [f64::NAN, f64::INFINITY] {
            config.source = SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs: Some(secs),
            };
            assert!(config.validate().is_err());
        }
        config.source = SourceKind::Tone {
            frequency_hz: 440.0,
            duration_secs: Some(0.0),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_durations() {
        let config = RelayConfig::from_json(MINIMAL).unwrap();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.reconnect_delay, Duration::from_secs(5));
        assert_eq!(pipeline.max_reconnect_delay, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(&dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = RelayConfig::load(&path).await.unwrap();
        assert_eq!(config.node_id, "la-01");
    }
}
