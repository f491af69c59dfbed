//! Owned child-process handle for long-lived helper processes
//!
//! Used for every subprocess the relay stack owns:
//! - `pifmrds` behind the GPIO radio transmitter
//! - the `ffmpeg` decoder behind the stream pipeline
//! - station relay processes launched by the supervisor
//!
//! The child is moved into a watcher task that awaits its exit and publishes
//! the result on a `watch` channel, so liveness is read from the channel
//! instead of probing PIDs. Dropping the handle never kills the child.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when terminating a child
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a watched child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// Exit code, `None` when the child was killed by a signal
    Exited(Option<i32>),
}

/// Handle to a child process whose exit is observed through a channel
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<ExitState>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Take ownership of a spawned child and start watching its exit.
    ///
    /// Stdio pipes the caller needs must be taken from the child before
    /// handing it over. Must be called from within a tokio runtime.
    pub fn watch(name: impl Into<String>, mut child: Child) -> Self {
        let name = name.into();
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let watcher_name = name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Only an explicit kill request matters; a dropped sender
                // disables this branch and the child keeps running
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill {}: {}", watcher_name, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Error waiting for {}: {}", watcher_name, e);
                    None
                }
            };
            debug!("{} exited (code: {:?})", watcher_name, code);
            let _ = exit_tx.send(ExitState::Exited(code));
        });

        Self {
            name,
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ExitState::Running
    }

    /// Exit code once the child has exited
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            ExitState::Exited(code) => code,
            ExitState::Running => None,
        }
    }

    /// Wait until the child exits
    pub async fn wait(&mut self) -> ExitState {
        match self
            .exit_rx
            .wait_for(|state| *state != ExitState::Running)
            .await
        {
            Ok(state) => *state,
            // Watcher gone without reporting: treat as exited
            Err(_) => ExitState::Exited(None),
        }
    }

    /// Graceful termination: SIGTERM, then SIGKILL once `grace` expires
    pub async fn terminate(&mut self, grace: Duration) -> ExitState {
        if !self.is_alive() {
            return self.state();
        }

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to {} (pid {}): {}", self.name, pid, e);
            }
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(state) => {
                debug!("{} stopped cleanly", self.name);
                state
            }
            Err(_) => {
                warn!("{} did not exit within {:?}, force killing", self.name, grace);
                if let Some(tx) = self.kill_tx.take() {
                    let _ = tx.send(());
                }
                self.wait().await
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}
