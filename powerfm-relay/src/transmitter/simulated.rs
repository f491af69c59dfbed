use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use super::{BackendDetails, TransmitterError, TransmitterKind, TransmitterOptions, TransmitterStatus};
use crate::audio::pcm_levels;

/// Level-logging backend for development and hosts without RF hardware
#[derive(Debug)]
pub struct SimulatedTransmitter {
    frequency: f64,
    log_interval: Duration,
    transmitting: AtomicBool,
    stats: Mutex<SimulatedStats>,
}

#[derive(Debug, Default)]
struct SimulatedStats {
    samples_received: u64,
    peak_level: f32,
    last_log: Option<Instant>,
}

impl SimulatedTransmitter {
    pub fn new(frequency: f64, options: &TransmitterOptions) -> Self {
        Self {
            frequency,
            log_interval: Duration::from_secs(options.log_interval_secs),
            transmitting: AtomicBool::new(false),
            stats: Mutex::new(SimulatedStats::default()),
        }
    }

    pub fn start(&self) -> Result<(), TransmitterError> {
        if self.transmitting.swap(true, Ordering::SeqCst) {
            return Err(TransmitterError::ResourceUnavailable(
                "simulated transmitter already running".into(),
            ));
        }
        self.stats.lock().last_log = Some(Instant::now());
        info!("[simulated] FM transmitter started on {:.1} MHz", self.frequency);
        Ok(())
    }

    pub fn stop(&self) {
        if self.transmitting.swap(false, Ordering::SeqCst) {
            let stats = self.stats.lock();
            info!(
                "[simulated] FM transmitter stopped ({} samples received)",
                stats.samples_received
            );
        }
    }

    pub fn feed_audio(&self, chunk: &[u8]) {
        if !self.is_transmitting() {
            return;
        }
        let Some(levels) = pcm_levels(chunk) else {
            return;
        };

        let mut stats = self.stats.lock();
        stats.samples_received += levels.samples as u64;
        stats.peak_level = levels.peak;

        let now = Instant::now();
        let due = stats
            .last_log
            .map_or(true, |last| now.duration_since(last) >= self.log_interval);
        if due {
            stats.last_log = Some(now);
            info!(
                "[simulated] {:.1} MHz | peak {:.2} | rms {:.2} | {} samples",
                self.frequency, levels.peak, levels.rms, stats.samples_received
            );
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TransmitterStatus {
        let stats = self.stats.lock();
        TransmitterStatus {
            backend: TransmitterKind::Simulated,
            frequency: self.frequency,
            is_transmitting: self.is_transmitting(),
            details: BackendDetails::Simulated {
                samples_received: stats.samples_received,
                peak_level: stats.peak_level,
            },
        }
    }
}
