//! Power FM relay node
//!
//! Pulls a network audio stream, decodes it to s16le mono PCM and feeds an
//! FM transmitter backend:
//! - Pluggable transmitter (simulated, GPIO `pifmrds`, Si4713 over I2C)
//! - Stream pipeline with capped exponential reconnect
//! - Heartbeat + registration reporting to the fleet registry
//! - Local `/status.json` endpoint for the station supervisor

pub mod audio;
pub mod config;
pub mod heartbeat;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod shutdown;
pub mod status;
pub mod transmitter;

pub use config::RelayConfig;
pub use pipeline::{PipelineState, PipelineStatus, StreamPipeline};
pub use transmitter::{Transmitter, TransmitterKind};
