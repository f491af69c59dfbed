use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use powerfm_relay::process::{ExitState, ProcessHandle};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::StationConfig;
use crate::error::SupervisorError;

const ADOPTED_POLL: Duration = Duration::from_millis(100);

/// A station process the supervisor can watch
#[derive(Debug)]
pub enum StationHandle {
    /// Spawned by this supervisor; exit observed through the watch channel
    Owned(ProcessHandle),
    /// Found in the state file from a previous supervisor run
    Adopted(u32),
}

impl StationHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            StationHandle::Owned(handle) => handle.pid(),
            StationHandle::Adopted(pid) => Some(*pid),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            StationHandle::Owned(handle) => handle.is_alive(),
            StationHandle::Adopted(pid) => pid_alive(*pid),
        }
    }

    /// SIGTERM, then SIGKILL after `grace`
    pub async fn terminate(&mut self, grace: Duration) {
        match self {
            StationHandle::Owned(handle) => {
                let state = handle.terminate(grace).await;
                if let ExitState::Exited(code) = state {
                    info!("{} exited (code {:?})", handle.name(), code);
                }
            }
            StationHandle::Adopted(pid) => {
                let target = Pid::from_raw(*pid as i32);
                if let Err(e) = kill(target, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
                    return;
                }
                let deadline = tokio::time::Instant::now() + grace;
                while pid_alive(*pid) {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("pid {} did not exit within {:?}, force killing", pid, grace);
                        let _ = kill(target, Signal::SIGKILL);
                        break;
                    }
                    tokio::time::sleep(ADOPTED_POLL).await;
                }
            }
        }
    }
}

/// `kill(pid, 0)`: EPERM still means the process exists
pub fn pid_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Spawns station processes
pub trait StationLauncher: Send + Sync {
    fn launch(&self, key: &str, station: &StationConfig) -> Result<StationHandle, SupervisorError>;
}

/// Launches one `powerfm-relay` per station, detached in its own process
/// group, output appended to `<log_dir>/station_<key>.log`
pub struct RelayLauncher {
    relay_binary: PathBuf,
    log_dir: PathBuf,
}

impl RelayLauncher {
    pub fn new(relay_binary: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            relay_binary,
            log_dir,
        }
    }

    pub fn log_path(&self, key: &str) -> PathBuf {
        self.log_dir.join(format!("station_{}.log", key))
    }

    /// Use the station's relay config, or write one from its table entry
    fn relay_config_path(&self, key: &str, station: &StationConfig) -> Result<PathBuf, SupervisorError> {
        if let Some(path) = &station.relay_config {
            return Ok(path.clone());
        }
        let source = station.source.as_ref().ok_or_else(|| {
            SupervisorError::Config(format!("station {} has no source", key))
        })?;
        let generated = serde_json::json!({
            "node_id": key,
            "name": station.name,
            "market": station.market.clone().unwrap_or_else(|| "unknown".into()),
            "stream_url": source,
            "fm_frequency": station.fm_frequency.unwrap_or(88.1),
            "status_port": station.port,
        });
        let path = self.log_dir.join(format!("station_{}.relay.json", key));
        fs::write(&path, serde_json::to_vec_pretty(&generated)?)?;
        Ok(path)
    }
}

impl StationLauncher for RelayLauncher {
    fn launch(&self, key: &str, station: &StationConfig) -> Result<StationHandle, SupervisorError> {
        fs::create_dir_all(&self.log_dir)?;
        let config_path = self.relay_config_path(key, station)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(key))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.relay_binary);
        cmd.arg("--config")
            .arg(&config_path)
            .arg("--status-port")
            .arg(station.port.to_string())
            .args(&station.args)
            .env("POWERFM_STATION_KEY", key)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            key: key.to_string(),
            source,
        })?;
        let handle = ProcessHandle::watch(format!("station {}", key), child);
        info!(
            "{} started (pid {:?}, port {})",
            station.name,
            handle.pid(),
            station.port
        );
        Ok(StationHandle::Owned(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(source: &str) -> StationConfig {
        StationConfig {
            name: "Power 92 Chicago".into(),
            market: Some("Chicago".into()),
            port: 8003,
            source: Some(source.into()),
            fm_frequency: Some(92.3),
            relay_config: None,
            args: vec![],
        }
    }

    #[tokio::test]
    async fn test_launch_detached_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-relay.sh");
        fs::write(&script, "#!/bin/sh\necho \"relay $@\"\nsleep 30\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&script, perms).unwrap();

        let launcher = RelayLauncher::new(script, dir.path().join("logs"));
        let mut handle = launcher.launch("chicago", &station("http://icecast/chi")).unwrap();
        assert!(handle.is_alive());

        let pid = handle.pid().unwrap();
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid as i32))).unwrap();
        assert_eq!(pgid.as_raw(), pid as i32);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let log = fs::read_to_string(launcher.log_path("chicago")).unwrap();
        assert!(log.contains("--status-port 8003"));

        let generated = fs::read_to_string(dir.path().join("logs/station_chicago.relay.json")).unwrap();
        let generated: serde_json::Value = serde_json::from_str(&generated).unwrap();
        assert_eq!(generated["stream_url"], "http://icecast/chi");
        assert_eq!(generated["status_port"], 8003);

        handle.terminate(Duration::from_secs(2)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RelayLauncher::new(PathBuf::from("/nonexistent/relay"), dir.path().to_path_buf());
        assert!(matches!(
            launcher.launch("la", &station("http://x")),
            Err(SupervisorError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_adopted_handle_liveness() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = StationHandle::Adopted(child.id());
        assert!(handle.is_alive());
        handle.terminate(Duration::from_millis(300)).await;
        // Reap so the pid disappears
        let mut child = child;
        child.wait().unwrap();
        assert!(!pid_alive(child.id()));
    }
}
