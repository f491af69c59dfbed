use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use super::si4713::Si4713;
use super::{BackendDetails, TransmitterError, TransmitterKind, TransmitterOptions, TransmitterStatus};

/// I2C transmitter chip. The bus device stays open (and flock'ed) for as
/// long as the backend is started.
#[derive(Debug)]
pub struct I2cRadioTransmitter {
    frequency: f64,
    bus: PathBuf,
    address: u16,
    tx_power: u8,
    transmitting: AtomicBool,
    device: Mutex<Option<Si4713>>,
}

impl I2cRadioTransmitter {
    pub fn new(frequency: f64, options: &TransmitterOptions) -> Self {
        Self {
            frequency,
            bus: options.i2c_bus.clone(),
            address: options.i2c_address,
            tx_power: options.tx_power,
            transmitting: AtomicBool::new(false),
            device: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), TransmitterError> {
        if self.transmitting.load(Ordering::SeqCst) || self.device.lock().is_some() {
            return Err(TransmitterError::ResourceUnavailable(format!(
                "{} already claimed by this relay",
                self.bus.display()
            )));
        }

        let bus = self.bus.clone();
        let (address, tx_power, frequency) = (self.address, self.tx_power, self.frequency);

        // Chip setup sleeps between commands; keep it off the runtime threads
        let device = tokio::task::spawn_blocking(move || {
            let mut chip = Si4713::open(&bus, address)?;
            chip.power_up()?;
            chip.set_tx_power(tx_power)?;
            chip.tune(frequency)?;
            Ok::<_, std::io::Error>(chip)
        })
        .await
        .map_err(|e| TransmitterError::ResourceUnavailable(format!("i2c setup task failed: {}", e)))?
        .map_err(|e| {
            TransmitterError::ResourceUnavailable(format!(
                "{} (address {:#04x}): {}",
                self.bus.display(),
                self.address,
                e
            ))
        })?;

        *self.device.lock() = Some(device);
        self.transmitting.store(true, Ordering::SeqCst);
        info!(
            "[i2c] FM transmitter started on {:.1} MHz ({} @ {:#04x}, {} dBuV)",
            self.frequency,
            self.bus.display(),
            self.address,
            self.tx_power
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.transmitting.store(false, Ordering::SeqCst);
        let Some(mut chip) = self.device.lock().take() else {
            return;
        };

        let result = tokio::task::spawn_blocking(move || {
            chip.set_tx_power(0)?;
            chip.power_down()
        })
        .await;

        match result {
            Ok(Ok(())) => info!("[i2c] FM transmitter stopped"),
            Ok(Err(e)) => warn!("[i2c] power down failed: {}", e),
            Err(e) => warn!("[i2c] power down task failed: {}", e),
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TransmitterStatus {
        TransmitterStatus {
            backend: TransmitterKind::I2cRadio,
            frequency: self.frequency,
            is_transmitting: self.is_transmitting(),
            details: BackendDetails::I2cRadio {
                bus: self.bus.display().to_string(),
                address: self.address,
                tx_power: self.tx_power,
            },
        }
    }
}
