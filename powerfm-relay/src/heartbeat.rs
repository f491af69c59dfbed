//! Heartbeat and registration reporting to the fleet registry
//!
//! Every `heartbeat_interval` the reporter snapshots the pipeline and host
//! metrics into a `HeartbeatMessage` and hands it to a sink. Registration is
//! re-sent every `registration_interval` so the registry learns about new
//! nodes on its own. Delivery failures are logged and dropped; the pipeline
//! never waits on the hub.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, RelayConfig};
use crate::metrics::{HostMetrics, MetricsCollector};
use crate::pipeline::{PipelineStatus, StreamPipeline};
use crate::transmitter::TransmitterKind;

pub const HEARTBEAT_TOPIC: &str = "powerfm/relays/heartbeat@v1";
pub const REGISTRATION_TOPIC: &str = "powerfm/relays/registration@v1";
pub const HEARTBEAT_PATH: &str = "/api/transmitters/heartbeat";
pub const REGISTRATION_PATH: &str = "/api/transmitters/register";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay heartbeat (matches powerfm/relays/heartbeat@v1)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
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

/// Relay self-registration (matches powerfm/relays/registration@v1)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationMessage {
    pub node_id: String,
    pub name: String,
    pub market: String,
    pub stream_url: String,
    pub fm_frequency: f64,
    pub transmitter_type: TransmitterKind,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl RegistrationMessage {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            name: config.display_name().to_string(),
            market: config.market.clone(),
            stream_url: config.stream_url.clone(),
            fm_frequency: config.fm_frequency,
            transmitter_type: config.transmitter_type,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl HeartbeatMessage {
    /// `ok` unless the pipeline carries an error, then `degraded`
    pub fn from_status(
        node_id: &str,
        pipeline: &PipelineStatus,
        host: &HostMetrics,
        uptime: Duration,
    ) -> Self {
        let errors: Vec<String> = pipeline.last_error.iter().cloned().collect();
        let status = if errors.is_empty() { "ok" } else { "degraded" };
        Self {
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            status: status.to_string(),
            stream_connected: pipeline.stream_connected,
            fm_transmitting: pipeline.fm_transmitting,
            cpu_temp: host.cpu_temp,
            cpu_usage: host.cpu_usage,
            memory_usage: host.memory_usage,
            uptime_seconds: uptime.as_secs(),
            buffer_health: pipeline.buffer_health,
            audio_level: pipeline.audio_level,
            errors,
        }
    }
}

/// Where heartbeats go
pub enum HeartbeatSink {
    Http {
        client: reqwest::Client,
        hub_url: String,
    },
    Mqtt {
        client: AsyncClient,
    },
    /// No hub configured: heartbeats are only logged
    Log,
}

impl HeartbeatSink {
    pub fn http(hub_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HeartbeatSink::Http {
            client,
            hub_url: hub_url.trim_end_matches('/').to_string(),
        })
    }

    /// Connect to the broker; the event loop runs until `cancel` fires
    pub fn mqtt(config: &MqttConfig, node_id: &str, cancel: CancellationToken) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("powerfm-relay-{}", node_id));
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("MQTT connected"),
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });

        HeartbeatSink::Mqtt { client }
    }

    /// HTTP hub wins over MQTT when both are configured
    pub fn from_config(config: &RelayConfig, cancel: CancellationToken) -> Result<Self> {
        if let Some(hub_url) = &config.hub_url {
            return Self::http(hub_url);
        }
        if let Some(mqtt) = &config.mqtt {
            return Ok(Self::mqtt(mqtt, &config.node_id, cancel));
        }
        warn!("No hub_url or mqtt configured, heartbeats will only be logged");
        Ok(HeartbeatSink::Log)
    }

    async fn deliver<T: Serialize>(&self, topic: &str, path: &str, message: &T) -> Result<()> {
        match self {
            HeartbeatSink::Http { client, hub_url } => {
                let url = format!("{}{}", hub_url, path);
                let response = client
                    .post(&url)
                    .json(message)
                    .send()
                    .await
                    .with_context(|| format!("POST {} failed", url))?;
                if !response.status().is_success() {
                    anyhow::bail!("POST {} returned {}", url, response.status());
                }
            }
            HeartbeatSink::Mqtt { client } => {
                let payload = serde_json::to_vec(message).context("Failed to serialize message")?;
                client
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await
                    .with_context(|| format!("Failed to publish to {}", topic))?;
            }
            HeartbeatSink::Log => {
                let payload = serde_json::to_string(message).context("Failed to serialize message")?;
                debug!("{}: {}", topic, payload);
            }
        }
        Ok(())
    }

    pub async fn send_heartbeat(&self, heartbeat: &HeartbeatMessage) -> Result<()> {
        self.deliver(HEARTBEAT_TOPIC, HEARTBEAT_PATH, heartbeat).await
    }

    pub async fn send_registration(&self, registration: &RegistrationMessage) -> Result<()> {
        self.deliver(REGISTRATION_TOPIC, REGISTRATION_PATH, registration).await
    }
}

pub struct HeartbeatReporter {
    node_id: String,
    registration: RegistrationMessage,
    heartbeat_interval: Duration,
    registration_interval: Duration,
    pipeline: Arc<StreamPipeline>,
    sink: HeartbeatSink,
    metrics: MetricsCollector,
    started: Instant,
}

impl HeartbeatReporter {
    pub fn new(config: &RelayConfig, pipeline: Arc<StreamPipeline>, sink: HeartbeatSink) -> Self {
        Self {
            node_id: config.node_id.clone(),
            registration: RegistrationMessage::from_config(config),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
            registration_interval: Duration::from_secs(config.registration_interval.max(1)),
            pipeline,
            sink,
            metrics: MetricsCollector::new(),
            started: Instant::now(),
        }
    }

    pub fn build_heartbeat(&mut self) -> HeartbeatMessage {
        let host = self.metrics.collect();
        HeartbeatMessage::from_status(
            &self.node_id,
            &self.pipeline.status(),
            &host,
            self.started.elapsed(),
        )
    }

    async fn register(&mut self) {
        self.registration.timestamp = Utc::now();
        match self.sink.send_registration(&self.registration).await {
            Ok(()) => info!("Relay {} registered with fleet", self.node_id),
            Err(e) => warn!("Registration dropped: {:#}", e),
        }
    }

    async fn send_heartbeat(&mut self) {
        let heartbeat = self.build_heartbeat();
        match self.sink.send_heartbeat(&heartbeat).await {
            Ok(()) => debug!(
                "Heartbeat sent (status {}, stream {}, fm {})",
                heartbeat.status, heartbeat.stream_connected, heartbeat.fm_transmitting
            ),
            Err(e) => warn!("Heartbeat dropped: {:#}", e),
        }
    }

    /// Report until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Heartbeat reporter started (every {:?})",
            self.heartbeat_interval
        );

        let mut heartbeat_timer = interval(self.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut registration_timer = interval(self.registration_interval);
        registration_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = registration_timer.tick() => self.register().await,
                _ = heartbeat_timer.tick() => self.send_heartbeat().await,
            }
        }
        info!("Heartbeat reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineConfig, SourceKind};
    use crate::transmitter::{Transmitter, TransmitterOptions};

    fn pipeline() -> Arc<StreamPipeline> {
        let config = PipelineConfig {
            stream_url: "tone://test".into(),
            frequency: 88.1,
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
            88.1,
            &TransmitterOptions::default(),
        ));
        Arc::new(StreamPipeline::new(config, transmitter))
    }

    fn relay_config() -> RelayConfig {
        RelayConfig::from_json(
            r#"{"node_id": "la-01", "name": "Los Angeles 1", "market": "los-angeles",
                "stream_url": "tone://test", "fm_frequency": 88.1}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_status_degraded_on_pipeline_error() {
        let pipeline = pipeline();
        let mut status = pipeline.status();
        let host = HostMetrics::default();

        let heartbeat = HeartbeatMessage::from_status("la-01", &status, &host, Duration::from_secs(90));
        assert_eq!(heartbeat.status, "ok");
        assert!(heartbeat.errors.is_empty());
        assert_eq!(heartbeat.uptime_seconds, 90);

        status.last_error = Some("stream source failed: connection refused".into());
        let heartbeat = HeartbeatMessage::from_status("la-01", &status, &host, Duration::from_secs(90));
        assert_eq!(heartbeat.status, "degraded");
        assert_eq!(heartbeat.errors.len(), 1);
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let heartbeat = HeartbeatMessage::from_status(
            "la-01",
            &pipeline().status(),
            &HostMetrics {
                cpu_temp: Some(52.5),
                cpu_usage: Some(12.0),
                memory_usage: Some(40.0),
            },
            Duration::from_secs(5),
        );
        let json: serde_json::Value = serde_json::to_value(&heartbeat).unwrap();
        for field in [
            "node_id",
            "timestamp",
            "status",
            "stream_connected",
            "fm_transmitting",
            "cpu_temp",
            "cpu_usage",
            "memory_usage",
            "uptime_seconds",
            "buffer_health",
            "audio_level",
            "errors",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        let back: HeartbeatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, heartbeat);
    }

    #[test]
    fn test_registration_from_config() {
        let registration = RegistrationMessage::from_config(&relay_config());
        assert_eq!(registration.name, "Los Angeles 1");
        assert_eq!(registration.market, "los-angeles");
        assert_eq!(registration.transmitter_type, TransmitterKind::Simulated);
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["transmitter_type"], "simulated");
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_dropped() {
        let sink = HeartbeatSink::http("http://127.0.0.1:9").unwrap();
        let mut reporter = HeartbeatReporter::new(&relay_config(), pipeline(), sink);
        let heartbeat = reporter.build_heartbeat();
        assert!(reporter.sink.send_heartbeat(&heartbeat).await.is_err());
        // The reporter path swallows the failure
        reporter.send_heartbeat().await;
    }

    #[tokio::test]
    async fn test_reporter_stops_on_cancel() {
        let reporter = HeartbeatReporter::new(&relay_config(), pipeline(), HeartbeatSink::Log);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reporter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
