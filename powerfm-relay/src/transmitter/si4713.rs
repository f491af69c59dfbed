//! Minimal Si4713 FM transmitter chip driver over Linux i2c-dev

use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;

const I2C_SLAVE: u16 = 0x0703;
nix::ioctl_write_int_bad!(i2c_set_slave_address, I2C_SLAVE);

const CMD_POWER_UP: u8 = 0x01;
const CMD_POWER_DOWN: u8 = 0x11;
const CMD_TX_TUNE_FREQ: u8 = 0x30;
const CMD_TX_TUNE_POWER: u8 = 0x31;

/// POWER_UP arg1: crystal oscillator on, transmit function
const POWER_UP_TRANSMIT: u8 = 0x12;
/// POWER_UP arg2: analog audio input
const POWER_UP_ANALOG_IN: u8 = 0x50;

const STATUS_CTS: u8 = 0x80;
const CTS_POLL_ATTEMPTS: u32 = 100;

#[derive(Debug)]
pub struct Si4713 {
    bus: File,
}

impl Si4713 {
    /// Open the bus exclusively and address the chip
    pub fn open(bus: &Path, address: u16) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(bus)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is locked by another process: {}", bus.display(), e),
            )
        })?;
        // SAFETY: fd is a valid open i2c-dev descriptor for the whole call
        unsafe { i2c_set_slave_address(file.as_raw_fd(), address as i32) }
            .map_err(io::Error::from)?;
        Ok(Self { bus: file })
    }

    pub fn power_up(&mut self) -> io::Result<()> {
        self.command(&[CMD_POWER_UP, POWER_UP_TRANSMIT, POWER_UP_ANALOG_IN])?;
        // Oscillator settle time
        thread::sleep(Duration::from_millis(500));
        Ok(())
    }

    /// Output level in dBuV, 0 disables the RF output
    pub fn set_tx_power(&mut self, dbuv: u8) -> io::Result<()> {
        let level = if dbuv == 0 { 0 } else { dbuv.clamp(88, 115) };
        self.command(&[CMD_TX_TUNE_POWER, 0x00, 0x00, level, 0x00])
    }

    /// Tune to `frequency` MHz (10 kHz steps)
    pub fn tune(&mut self, frequency: f64) -> io::Result<()> {
        let units = frequency_units(frequency);
        let [hi, lo] = units.to_be_bytes();
        self.command(&[CMD_TX_TUNE_FREQ, 0x00, hi, lo])?;
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    pub fn power_down(&mut self) -> io::Result<()> {
        self.command(&[CMD_POWER_DOWN])
    }

    fn command(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bus.write_all(bytes)?;
        self.wait_cts()
    }

    fn wait_cts(&mut self) -> io::Result<()> {
        let mut status = [0u8; 1];
        for _ in 0..CTS_POLL_ATTEMPTS {
            self.bus.read_exact(&mut status)?;
            if status[0] & STATUS_CTS != 0 {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Si4713 did not report clear-to-send",
        ))
    }
}

/// MHz to the chip's 10 kHz frequency units
pub fn frequency_units(frequency: f64) -> u16 {
    (frequency * 100.0).round() as u16
}
