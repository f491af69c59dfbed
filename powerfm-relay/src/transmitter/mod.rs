//! FM transmitter backends
//!
//! One closed set of backends behind a single type:
//! - `Simulated`: logs levels, no RF
//! - `GpioRadio`: `pifmrds` subprocess fed through stdin
//! - `I2cRadio`: Si4713 chip on an I2C bus, audio through analog line-in
//!
//! All operations take `&self`; each backend guards its own resource so a
//! status read never waits behind an audio write.

mod gpio;
mod i2c;
mod si4713;
mod simulated;

pub use gpio::GpioRadioTransmitter;
pub use i2c::I2cRadioTransmitter;
pub use simulated::SimulatedTransmitter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransmitterError {
    #[error("transmitter resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("transmitter write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("unknown transmitter type '{0}' (expected simulated, gpio_radio or i2c_radio)")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitterKind {
    #[default]
    Simulated,
    #[serde(alias = "rpitx")]
    GpioRadio,
    #[serde(alias = "si4713")]
    I2cRadio,
}

impl TransmitterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitterKind::Simulated => "simulated",
            TransmitterKind::GpioRadio => "gpio_radio",
            TransmitterKind::I2cRadio => "i2c_radio",
        }
    }
}

impl fmt::Display for TransmitterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransmitterKind {
    type Err = TransmitterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(TransmitterKind::Simulated),
            "gpio_radio" | "rpitx" => Ok(TransmitterKind::GpioRadio),
            "i2c_radio" | "si4713" => Ok(TransmitterKind::I2cRadio),
            other => Err(TransmitterError::UnknownKind(other.to_string())),
        }
    }
}

/// Backend options; each backend reads only the fields it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterOptions {
    /// Simulated: seconds between level log lines
    pub log_interval_secs: u64,
    pub pifmrds_path: PathBuf,
    pub use_sudo: bool,
    /// GPIO drive strength 0-7
    pub power: u8,
    pub rds_station: String,
    pub rds_text: String,
    pub i2c_bus: PathBuf,
    pub i2c_address: u16,
    /// Si4713 output level in dBuV (88-115)
    pub tx_power: u8,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            log_interval_secs: 5,
            pifmrds_path: PathBuf::from("/usr/local/bin/pifmrds"),
            use_sudo: true,
            power: 7,
            rds_station: "POWER FM".to_string(),
            rds_text: "Power FM - live relay".to_string(),
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            i2c_address: 0x63,
            tx_power: 115,
        }
    }
}

/// Backend-specific status fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackendDetails {
    Simulated {
        samples_received: u64,
        peak_level: f32,
    },
    GpioRadio {
        pid: Option<u32>,
        running: bool,
        exit_code: Option<i32>,
        rds_station: String,
        power: u8,
    },
    I2cRadio {
        bus: String,
        address: u16,
        tx_power: u8,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransmitterStatus {
    pub backend: TransmitterKind,
    /// MHz
    pub frequency: f64,
    pub is_transmitting: bool,
    pub details: BackendDetails,
}

#[derive(Debug)]
pub enum Transmitter {
    Simulated(SimulatedTransmitter),
    GpioRadio(GpioRadioTransmitter),
    I2cRadio(I2cRadioTransmitter),
}

impl Transmitter {
    /// Build the backend selected by configuration. Nothing is claimed
    /// until `start`.
    pub fn from_config(kind: TransmitterKind, frequency: f64, options: &TransmitterOptions) -> Self {
        match kind {
            TransmitterKind::Simulated => {
                Transmitter::Simulated(SimulatedTransmitter::new(frequency, options))
            }
            TransmitterKind::GpioRadio => {
                Transmitter::GpioRadio(GpioRadioTransmitter::new(frequency, options))
            }
            TransmitterKind::I2cRadio => {
                Transmitter::I2cRadio(I2cRadioTransmitter::new(frequency, options))
            }
        }
    }

    pub fn kind(&self) -> TransmitterKind {
        match self {
            Transmitter::Simulated(_) => TransmitterKind::Simulated,
            Transmitter::GpioRadio(_) => TransmitterKind::GpioRadio,
            Transmitter::I2cRadio(_) => TransmitterKind::I2cRadio,
        }
    }

    pub async fn start(&self) -> Result<(), TransmitterError> {
        match self {
            Transmitter::Simulated(t) => t.start(),
            Transmitter::GpioRadio(t) => t.start().await,
            Transmitter::I2cRadio(t) => t.start().await,
        }
    }

    /// Idempotent; safe on a backend that never started
    pub async fn stop(&self) {
        match self {
            Transmitter::Simulated(t) => t.stop(),
            Transmitter::GpioRadio(t) => t.stop().await,
            Transmitter::I2cRadio(t) => t.stop().await,
        }
    }

    /// No-op when not started or when the chunk is empty
    pub async fn feed_audio(&self, chunk: &[u8]) -> Result<(), TransmitterError> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self {
            Transmitter::Simulated(t) => {
                t.feed_audio(chunk);
                Ok(())
            }
            Transmitter::GpioRadio(t) => t.feed_audio(chunk).await,
            // Audio reaches the chip through its analog input
            Transmitter::I2cRadio(_) => Ok(()),
        }
    }

    pub fn is_transmitting(&self) -> bool {
        match self {
            Transmitter::Simulated(t) => t.is_transmitting(),
            Transmitter::GpioRadio(t) => t.is_transmitting(),
            Transmitter::I2cRadio(t) => t.is_transmitting(),
        }
    }

    pub fn status(&self) -> TransmitterStatus {
        match self {
            Transmitter::Simulated(t) => t.status(),
            Transmitter::GpioRadio(t) => t.status(),
            Transmitter::I2cRadio(t) => t.status(),
        }
    }
}
