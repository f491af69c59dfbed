//! Stream pipeline: network audio source → PCM chunks → transmitter
//!
//! A single tokio task owns the source session and feeds chunks to the
//! transmitter in read order. Control (`start`/`stop`) and `status` only
//! touch the shared snapshot, never the stream I/O.
//!
//! State machine: idle → connecting → connected ⇄ reconnecting → stopped

mod backoff;
mod source;

pub use backoff::Backoff;
pub use source::SourceKind;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::pcm_levels;
use crate::transmitter::{Transmitter, TransmitterError, TransmitterStatus};
use source::StreamSession;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error(transparent)]
    Transmitter(#[from] TransmitterError),
    #[error("stream source failed: {0}")]
    Source(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stream_url: String,
    /// MHz
    pub frequency: f64,
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub source: SourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub stream_connected: bool,
    pub fm_transmitting: bool,
    pub buffer_health: Option<f32>,
    pub audio_level: Option<f32>,
    pub last_error: Option<String>,
    pub reconnect_count: u32,
    pub bytes_streamed: u64,
    pub stream_url: String,
    pub frequency: f64,
    pub transmitter: TransmitterStatus,
}

#[derive(Debug)]
struct StreamSnapshot {
    state: PipelineState,
    stream_connected: bool,
    buffer_health: Option<f32>,
    audio_level: Option<f32>,
    last_error: Option<String>,
    reconnect_count: u32,
    bytes_streamed: u64,
}

impl Default for StreamSnapshot {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            stream_connected: false,
            buffer_health: None,
            audio_level: None,
            last_error: None,
            reconnect_count: 0,
            bytes_streamed: 0,
        }
    }
}

type Shared<T> = Arc<Mutex<T>>;

pub struct StreamPipeline {
    config: PipelineConfig,
    transmitter: Arc<Transmitter>,
    snapshot: Shared<StreamSnapshot>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum SessionEnd {
    Cancelled,
    EndOfStream,
}

impl StreamPipeline {
    pub fn new(config: PipelineConfig, transmitter: Arc<Transmitter>) -> Self {
        Self {
            config,
            transmitter,
            snapshot: Arc::new(Mutex::new(StreamSnapshot::default())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    /// Start the transmitter, then the stream task.
    ///
    /// A transmitter failure is fatal: the pipeline goes straight to
    /// `stopped` and the error is returned.
    pub async fn start(&self) -> Result<(), PipelineError> {
        {
            let mut snapshot = self.snapshot.lock();
            if snapshot.state != PipelineState::Idle {
                return Err(PipelineError::AlreadyStarted);
            }
            snapshot.state = PipelineState::Connecting;
        }

        info!(
            "Starting pipeline: {} → {} on {:.1} MHz",
            self.config.stream_url,
            self.transmitter.kind(),
            self.config.frequency
        );

        if let Err(e) = self.transmitter.start().await {
            error!("Transmitter failed to start: {}", e);
            let mut snapshot = self.snapshot.lock();
            snapshot.state = PipelineState::Stopped;
            snapshot.last_error = Some(e.to_string());
            return Err(e.into());
        }

        let task = tokio::spawn(run_stream_loop(
            self.config.clone(),
            Arc::clone(&self.transmitter),
            Arc::clone(&self.snapshot),
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Cancel the stream task, release the decoder and the transmitter.
    /// Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Stream task ended abnormally: {}", e);
            }
        }
        self.transmitter.stop().await;

        let mut snapshot = self.snapshot.lock();
        if snapshot.state != PipelineState::Stopped {
            info!("Pipeline stopped");
        }
        snapshot.state = PipelineState::Stopped;
        snapshot.stream_connected = false;
    }

    pub fn state(&self) -> PipelineState {
        self.snapshot.lock().state
    }

    pub fn status(&self) -> PipelineStatus {
        let transmitter = self.transmitter.status();
        let snapshot = self.snapshot.lock();
        PipelineStatus {
            state: snapshot.state,
            stream_connected: snapshot.stream_connected,
            fm_transmitting: transmitter.is_transmitting,
            buffer_health: snapshot.buffer_health,
            audio_level: snapshot.audio_level,
            last_error: snapshot.last_error.clone(),
            reconnect_count: snapshot.reconnect_count,
            bytes_streamed: snapshot.bytes_streamed,
            stream_url: self.config.stream_url.clone(),
            frequency: self.config.frequency,
            transmitter,
        }
    }
}

async fn run_stream_loop(
    config: PipelineConfig,
    transmitter: Arc<Transmitter>,
    snapshot: Shared<StreamSnapshot>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);

    loop {
        if cancel.is_cancelled() {
            break;
        }
        info!("Connecting to stream: {}", config.stream_url);

        let outcome = run_session(&config, &transmitter, &snapshot, &cancel, &mut backoff).await;
        match outcome {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::EndOfStream) => warn!("Stream ended: {}", config.stream_url),
            Err(e) => {
                error!("Stream error: {}", e);
                snapshot.lock().last_error = Some(e.to_string());
            }
        }

        let delay = backoff.next_delay();
        {
            let mut snapshot = snapshot.lock();
            snapshot.state = PipelineState::Reconnecting;
            snapshot.stream_connected = false;
            snapshot.buffer_health = Some(0.0);
            snapshot.reconnect_count += 1;
        }
        info!(
            "Reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempt()
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        snapshot.lock().state = PipelineState::Connecting;
    }

    let mut snapshot = snapshot.lock();
    snapshot.stream_connected = false;
    snapshot.buffer_health = Some(0.0);
    debug!("Stream loop exited");
}

async fn run_session(
    config: &PipelineConfig,
    transmitter: &Transmitter,
    snapshot: &Shared<StreamSnapshot>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<SessionEnd, PipelineError> {
    let mut session = StreamSession::open(config).map_err(PipelineError::Source)?;
    let mut buf = vec![0u8; config.chunk_size];
    let mut first_chunk = true;

    let outcome = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),
            read = session.read_chunk(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break Ok(SessionEnd::EndOfStream),
            Ok(n) => n,
            Err(e) => break Err(PipelineError::Source(e)),
        };
        let chunk = &buf[..n];

        if first_chunk {
            first_chunk = false;
            backoff.reset();
            let mut snapshot = snapshot.lock();
            snapshot.state = PipelineState::Connected;
            snapshot.stream_connected = true;
            snapshot.last_error = None;
            info!("Stream connected: {}", config.stream_url);
        }

        if let Err(e) = transmitter.feed_audio(chunk).await {
            break Err(PipelineError::Transmitter(e));
        }

        let mut snapshot = snapshot.lock();
        snapshot.buffer_health = Some(1.0);
        if let Some(levels) = pcm_levels(chunk) {
            snapshot.audio_level = Some(levels.peak);
        }
        snapshot.bytes_streamed += n as u64;
    };

    session.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmitter::{BackendDetails, TransmitterKind, TransmitterOptions};

    fn tone_config(duration_secs: Option<f64>) -> PipelineConfig {
        PipelineConfig {
            stream_url: "tone://test".into(),
            frequency: 88.1,
            sample_rate: 8000,
            chunk_size: 400,
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(80),
            source: SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs,
            },
        }
    }

    fn simulated() -> Arc<Transmitter> {
        Arc::new(Transmitter::from_config(
            TransmitterKind::Simulated,
            88.1,
            &TransmitterOptions::default(),
        ))
    }

    fn samples_received(status: &PipelineStatus) -> u64 {
        match status.transmitter.details {
            BackendDetails::Simulated { samples_received, .. } => samples_received,
            _ => 0,
        }
    }

    #[tokio::test]
    async fn test_streams_chunks_to_transmitter() {
        let pipeline = StreamPipeline::new(tone_config(None), simulated());
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Connected);
        assert!(status.stream_connected);
        assert!(status.fm_transmitting);
        assert_eq!(status.buffer_health, Some(1.0));
        assert!(status.audio_level.unwrap() > 0.4);
        assert!(samples_received(&status) > 0);

        pipeline.stop().await;
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Stopped);
        assert!(!status.stream_connected);
        assert!(!status.fm_transmitting);
    }

    #[tokio::test]
    async fn test_reconnects_after_end_of_stream() {
        // Each session lasts 50 ms, then the source hits EOF
        let pipeline = StreamPipeline::new(tone_config(Some(0.05)), simulated());
        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let status = pipeline.status();
        assert!(status.reconnect_count >= 2, "reconnects: {}", status.reconnect_count);
        // A session that delivered audio counts as a clean connection,
        // so the delay never grows and no error is recorded
        assert!(status.last_error.is_none());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_failing_source_backs_off() {
        let mut config = tone_config(None);
        config.source = SourceKind::Ffmpeg;
        config.stream_url = "/nonexistent/stream.mp3".into();
        config.reconnect_delay = Duration::from_millis(50);
        config.max_reconnect_delay = Duration::from_secs(10);

        let pipeline = StreamPipeline::new(config, simulated());
        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = pipeline.status();
        assert!(!status.stream_connected);
        assert_eq!(status.buffer_health, Some(0.0));
        // 50 + 100 + 200 ms of backoff, then a 400 ms wait: at most 4 sessions
        // fit in the window whether ffmpeg is missing or fails on the path
        assert!(status.reconnect_count <= 4, "reconnects: {}", status.reconnect_count);
        pipeline.stop().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_transmitter_failure_is_fatal_on_start() {
        let options = TransmitterOptions {
            i2c_bus: "/nonexistent/i2c".into(),
            ..TransmitterOptions::default()
        };
        let transmitter = Arc::new(Transmitter::from_config(
            TransmitterKind::I2cRadio,
            88.1,
            &options,
        ));
        let pipeline = StreamPipeline::new(tone_config(None), transmitter);

        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::Transmitter(TransmitterError::ResourceUnavailable(_)))
        ));
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Stopped);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_double_start_refused() {
        let pipeline = StreamPipeline::new(tone_config(None), simulated());
        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::AlreadyStarted)
        ));
        pipeline.stop().await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff_sleep() {
        let mut config = tone_config(Some(0.01));
        config.reconnect_delay = Duration::from_secs(30);
        config.max_reconnect_delay = Duration::from_secs(60);

        let pipeline = StreamPipeline::new(config, simulated());
        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pipeline.state(), PipelineState::Reconnecting);

        tokio::time::timeout(Duration::from_secs(2), pipeline.stop())
            .await
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
