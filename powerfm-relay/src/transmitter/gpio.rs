use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{error, info};

use super::{BackendDetails, TransmitterError, TransmitterKind, TransmitterOptions, TransmitterStatus};
use crate::process::{ProcessHandle, DEFAULT_TERMINATE_GRACE};

const RDS_STATION_MAX: usize = 8;
const RDS_TEXT_MAX: usize = 64;

/// GPIO software-defined radio driven by a `pifmrds` child process.
///
/// PCM is streamed to the child's stdin (`-audio -`). The child is owned
/// through a `ProcessHandle`, so liveness comes from its exit channel.
#[derive(Debug)]
pub struct GpioRadioTransmitter {
    frequency: f64,
    pifmrds_path: PathBuf,
    use_sudo: bool,
    power: u8,
    rds_station: String,
    rds_text: String,
    transmitting: AtomicBool,
    process: Mutex<Option<ProcessHandle>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl GpioRadioTransmitter {
    pub fn new(frequency: f64, options: &TransmitterOptions) -> Self {
        Self {
            frequency,
            pifmrds_path: options.pifmrds_path.clone(),
            use_sudo: options.use_sudo,
            power: options.power.min(7),
            rds_station: options.rds_station.chars().take(RDS_STATION_MAX).collect(),
            rds_text: options.rds_text.chars().take(RDS_TEXT_MAX).collect(),
            transmitting: AtomicBool::new(false),
            process: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.pifmrds_path);
            cmd
        } else {
            Command::new(&self.pifmrds_path)
        };
        cmd.arg("-freq")
            .arg(format!("{:.1}", self.frequency))
            .args(["-audio", "-"])
            .arg("-ps")
            .arg(&self.rds_station)
            .arg("-rt")
            .arg(&self.rds_text)
            .arg("-power")
            .arg(self.power.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }

    pub async fn start(&self) -> Result<(), TransmitterError> {
        let stdin = {
            let mut process = self.process.lock();
            if let Some(existing) = process.as_ref() {
                if existing.is_alive() {
                    return Err(TransmitterError::ResourceUnavailable(format!(
                        "pifmrds already running (pid {:?})",
                        existing.pid()
                    )));
                }
            }

            let mut child = self.command().spawn().map_err(|e| {
                TransmitterError::ResourceUnavailable(format!(
                    "cannot spawn {}: {}",
                    self.pifmrds_path.display(),
                    e
                ))
            })?;
            let stdin = child.stdin.take().ok_or_else(|| {
                TransmitterError::ResourceUnavailable("pifmrds stdin not captured".into())
            })?;
            let handle = ProcessHandle::watch("pifmrds", child);
            info!(
                "[gpio] FM transmitter started on {:.1} MHz (pid {:?}, power {})",
                self.frequency,
                handle.pid(),
                self.power
            );
            *process = Some(handle);
            stdin
        };

        *self.stdin.lock().await = Some(stdin);
        self.transmitting.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop(&self) {
        self.transmitting.store(false, Ordering::SeqCst);
        // Closing stdin lets pifmrds drain and exit on its own
        self.stdin.lock().await.take();

        let handle = self.process.lock().take();
        if let Some(mut handle) = handle {
            let state = handle.terminate(DEFAULT_TERMINATE_GRACE).await;
            info!("[gpio] FM transmitter stopped ({:?})", state);
        }
    }

    pub async fn feed_audio(&self, chunk: &[u8]) -> Result<(), TransmitterError> {
        if !self.transmitting.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Ok(());
        };

        let result = match stdin.write_all(chunk).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.transmitting.store(false, Ordering::SeqCst);
            guard.take();
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                error!("[gpio] pifmrds pipe closed, transmitter process died");
            } else {
                error!("[gpio] write to pifmrds failed: {}", e);
            }
            return Err(TransmitterError::Write(e));
        }
        Ok(())
    }

    pub fn is_transmitting(&self) -> bool {
        if !self.transmitting.load(Ordering::SeqCst) {
            return false;
        }
        self.process
            .lock()
            .as_ref()
            .map_or(false, |handle| handle.is_alive())
    }

    pub fn status(&self) -> TransmitterStatus {
        let (pid, running, exit_code) = match self.process.lock().as_ref() {
            Some(handle) => (handle.pid(), handle.is_alive(), handle.exit_code()),
            None => (None, false, None),
        };
        TransmitterStatus {
            backend: TransmitterKind::GpioRadio,
            frequency: self.frequency,
            is_transmitting: self.transmitting.load(Ordering::SeqCst) && running,
            details: BackendDetails::GpioRadio {
                pid,
                running,
                exit_code,
                rds_station: self.rds_station.clone(),
                power: self.power,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options_with(path: &str) -> TransmitterOptions {
        TransmitterOptions {
            pifmrds_path: PathBuf::from(path),
            use_sudo: false,
            rds_station: "POWER FM LOS ANGELES".into(),
            ..TransmitterOptions::default()
        }
    }

    #[test]
    fn test_rds_fields_truncated() {
        let transmitter = GpioRadioTransmitter::new(88.1, &options_with("/bin/cat"));
        match transmitter.status().details {
            BackendDetails::GpioRadio { rds_station, .. } => assert_eq!(rds_station, "POWER FM"),
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let transmitter = GpioRadioTransmitter::new(88.1, &options_with("/nonexistent/pifmrds"));
        assert!(matches!(
            transmitter.start().await,
            Err(TransmitterError::ResourceUnavailable(_))
        ));
        assert!(!transmitter.is_transmitting());
    }

    #[tokio::test]
    async fn test_dead_child_fails_write() {
        // `true` ignores its arguments and exits at once
        let transmitter = GpioRadioTransmitter::new(88.1, &options_with("true"));
        transmitter.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let chunk = vec![0u8; 64 * 1024];
        let mut result = Ok(());
        for _ in 0..8 {
            result = transmitter.feed_audio(&chunk).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransmitterError::Write(_))));
        assert!(!transmitter.is_transmitting());

        // Later chunks are silently dropped
        transmitter.feed_audio(&chunk).await.unwrap();
        transmitter.stop().await;
    }
}
