//! Station supervision with bounded restarts
//!
//! Keeps a set of named stations alive on one host, one `powerfm-relay`
//! process per station:
//! - Liveness from the owned handle's exit channel, or `kill(pid, 0)` for adopted pids
//! - HTTP probe of `GET /status.json` on the station port
//! - healthy / degraded (logged, not restarted) / down
//! - Per-station sliding restart window; the attempt is recorded before the spawn

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{StationConfig, SupervisorConfig};
use crate::error::SupervisorError;
use crate::launcher::{pid_alive, StationHandle, StationLauncher};
use crate::probe::{ProbeResult, StatusProbe};
use crate::state::PidStateFile;
use crate::table::CycleReport;
use crate::window::RestartWindow;
use powerfm_relay::process::DEFAULT_TERMINATE_GRACE;

/// Classifications kept per station
const HISTORY_LEN: usize = 5;

/// Station classification after a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StationHealth {
    Healthy,
    Degraded,
    Down,
}

/// What was done about a down station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartAction {
    Restarted,
    RestartFailed,
    RestartSuppressed,
    NoRestartRequested,
}

impl StationHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationHealth::Healthy => "healthy",
            StationHealth::Degraded => "degraded",
            StationHealth::Down => "down",
        }
    }
}

impl RestartAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartAction::Restarted => "restarted",
            RestartAction::RestartFailed => "restart_failed",
            RestartAction::RestartSuppressed => "restart_suppressed",
            RestartAction::NoRestartRequested => "no_restart_requested",
        }
    }
}

/// One station's check result (one table row)
#[derive(Debug, Clone, Serialize)]
pub struct StationCheck {
    pub key: String,
    pub name: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub liveness: bool,
    pub probe: ProbeResult,
    pub health: StationHealth,
    pub action: Option<RestartAction>,
    pub restarts: usize,
    pub max_restarts: usize,
}

/// Runtime state of one station
#[derive(Debug)]
struct StationRuntime {
    config: StationConfig,
    handle: Option<StationHandle>,
    restarts: RestartWindow,
    history: VecDeque<StationHealth>,
}

/// Station view for `list`
#[derive(Debug, Clone, Serialize)]
pub struct StationInfo {
    pub key: String,
    pub name: String,
    pub market: Option<String>,
    pub port: u16,
    pub running: bool,
    pub pid: Option<u32>,
    pub recent: Vec<StationHealth>,
}

pub struct StationSupervisor<L: StationLauncher, P: StatusProbe> {
    launcher: L,
    probe: P,
    stations: BTreeMap<String, StationRuntime>,
    state: PidStateFile,
    check_interval: Duration,
    restart_window: Duration,
    stop_grace: Duration,
}

impl<L: StationLauncher, P: StatusProbe> StationSupervisor<L, P> {
    /// Loads the state file and adopts stations that are still alive
    pub async fn new(config: &SupervisorConfig, launcher: L, probe: P) -> Self {
        let mut state = PidStateFile::load(&config.state_file).await;

        let mut stations = BTreeMap::new();
        for (key, station) in &config.stations {
            let handle = match state.get(key) {
                Some(pid) if pid_alive(pid) => {
                    info!("Adopted running station {} (pid {})", key, pid);
                    Some(StationHandle::Adopted(pid))
                }
                _ => None,
            };
            stations.insert(
                key.clone(),
                StationRuntime {
                    config: station.clone(),
                    handle,
                    restarts: RestartWindow::new(config.max_restarts, config.restart_window()),
                    history: VecDeque::with_capacity(HISTORY_LEN),
                },
            );
        }

        // Dead pids or stations no longer configured
        let stale: Vec<String> = state
            .entries()
            .filter(|(key, _)| stations.get(*key).map_or(true, |s: &StationRuntime| s.handle.is_none()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Err(e) = state.remove(&key).await {
                warn!("Failed to clear stale pid for {}: {}", key, e);
            }
        }

        Self {
            launcher,
            probe,
            stations,
            state,
            check_interval: config.check_interval(),
            restart_window: config.restart_window(),
            stop_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn station_keys(&self) -> Vec<String> {
        self.stations.keys().cloned().collect()
    }

    async fn remember_pid(&mut self, key: &str, pid: Option<u32>) {
        if let Some(pid) = pid {
            if let Err(e) = self.state.set(key, pid).await {
                warn!("Failed to record pid for {}: {}", key, e);
            }
        }
    }

    async fn forget_pid(&mut self, key: &str) {
        if let Err(e) = self.state.remove(key).await {
            warn!("Failed to clear pid for {}: {}", key, e);
        }
    }

    /// Liveness; a stale handle or pid is cleared
    pub async fn is_running(&mut self, key: &str) -> Result<bool, SupervisorError> {
        let runtime = self
            .stations
            .get_mut(key)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;

        match &runtime.handle {
            Some(handle) if handle.is_alive() => Ok(true),
            Some(handle) => {
                info!("{}: process {:?} is gone", key, handle.pid());
                runtime.handle = None;
                self.forget_pid(key).await;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Starts a station; refuses when it is already running
    pub async fn start_station(&mut self, key: &str) -> Result<Option<u32>, SupervisorError> {
        if self.is_running(key).await? {
            let pid = self.stations.get(key).and_then(|s| s.handle.as_ref()).and_then(|h| h.pid());
            return Err(SupervisorError::AlreadyRunning {
                key: key.to_string(),
                pid,
            });
        }

        let runtime = self
            .stations
            .get_mut(key)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;
        let handle = self.launcher.launch(key, &runtime.config)?;
        let pid = handle.pid();
        runtime.handle = Some(handle);
        self.remember_pid(key, pid).await;
        Ok(pid)
    }

    /// SIGTERM, then SIGKILL after the grace period; `false` when nothing was running
    pub async fn stop_station(&mut self, key: &str) -> Result<bool, SupervisorError> {
        let grace = self.stop_grace;
        let runtime = self
            .stations
            .get_mut(key)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;

        let Some(mut handle) = runtime.handle.take() else {
            self.forget_pid(key).await;
            return Ok(false);
        };
        let was_alive = handle.is_alive();
        if was_alive {
            handle.terminate(grace).await;
            info!("Stopped {} (pid {:?})", key, handle.pid());
        }
        self.forget_pid(key).await;
        Ok(was_alive)
    }

    /// Liveness, probe, then restart if allowed
    pub async fn check_station(
        &mut self,
        key: &str,
        allow_restart: bool,
        now: Instant,
    ) -> Result<StationCheck, SupervisorError> {
        let liveness = self.is_running(key).await?;
        let port = self
            .stations
            .get(key)
            .map(|s| s.config.port)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;
        let probe = self.probe.probe(port).await;

        let health = match (liveness, probe.ok) {
            (true, true) => StationHealth::Healthy,
            (true, false) => StationHealth::Degraded,
            (false, _) => StationHealth::Down,
        };

        let runtime = self
            .stations
            .get_mut(key)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;
        let name = runtime.config.name.clone();
        let max_restarts = runtime.restarts.max_restarts();
        let mut action = None;
        let mut new_pid = None;

        match health {
            StationHealth::Healthy => {}
            StationHealth::Degraded => warn!(
                "{} ({}): process alive but status probe failed: {}",
                name,
                key,
                probe.error.as_deref().unwrap_or("unknown error")
            ),
            StationHealth::Down if !allow_restart => {
                action = Some(RestartAction::NoRestartRequested);
            }
            StationHealth::Down => {
                if runtime.restarts.try_record(now) {
                    warn!(
                        "{} ({}): DOWN, attempting restart ({}/{})",
                        name,
                        key,
                        runtime.restarts.count(now),
                        max_restarts
                    );
                    match self.launcher.launch(key, &runtime.config) {
                        Ok(handle) => {
                            new_pid = handle.pid();
                            runtime.handle = Some(handle);
                            action = Some(RestartAction::Restarted);
                            info!("{} ({}): restart initiated (pid {:?})", name, key, new_pid);
                        }
                        Err(e) => {
                            action = Some(RestartAction::RestartFailed);
                            error!("{} ({}): restart failed: {}", name, key, e);
                        }
                    }
                } else {
                    action = Some(RestartAction::RestartSuppressed);
                    error!(
                        "{} ({}): DOWN but restart suppressed ({} restarts in the last {}s)",
                        name,
                        key,
                        max_restarts,
                        self.restart_window.as_secs()
                    );
                }
            }
        }

        let runtime = self
            .stations
            .get_mut(key)
            .ok_or_else(|| SupervisorError::UnknownStation(key.to_string()))?;
        if let Some(previous) = runtime.history.back() {
            if *previous != health {
                info!("{} ({}): {} → {}", name, key, previous.as_str(), health.as_str());
            }
        }
        if runtime.history.len() == HISTORY_LEN {
            runtime.history.pop_front();
        }
        runtime.history.push_back(health);
        let restarts = runtime.restarts.count(now);
        let pid = runtime.handle.as_ref().and_then(|h| h.pid());

        if new_pid.is_some() {
            self.remember_pid(key, new_pid).await;
        }

        Ok(StationCheck {
            key: key.to_string(),
            name,
            port,
            pid,
            liveness,
            probe,
            health,
            action,
            restarts,
            max_restarts,
        })
    }

    /// One check over every station
    pub async fn run_cycle(&mut self, allow_restart: bool) -> CycleReport {
        let mut checks = Vec::with_capacity(self.stations.len());
        for key in self.station_keys() {
            match self.check_station(&key, allow_restart, Instant::now()).await {
                Ok(check) => checks.push(check),
                Err(e) => error!("Check of {} failed: {}", key, e),
            }
        }
        let report = CycleReport::new(checks);
        report.log_summary();
        report
    }

    pub fn list(&self) -> Vec<StationInfo> {
        self.stations
            .iter()
            .map(|(key, runtime)| StationInfo {
                key: key.clone(),
                name: runtime.config.name.clone(),
                market: runtime.config.market.clone(),
                port: runtime.config.port,
                running: runtime.handle.as_ref().map_or(false, |h| h.is_alive()),
                pid: runtime.handle.as_ref().and_then(|h| h.pid()),
                recent: runtime.history.iter().copied().collect(),
            })
            .collect()
    }

    /// Periodic checks until cancelled
    pub async fn run_daemon(&mut self, cancel: CancellationToken) {
        info!(
            "Station supervisor daemon starting (interval {:?}, {} stations)",
            self.check_interval,
            self.stations.len()
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cycle: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    cycle += 1;
                    info!("--- Health check cycle {} ---", cycle);
                    let report = self.run_cycle(true).await;
                    println!("{}", report.render());
                }
            }
        }
        info!("Station supervisor daemon stopped; stations keep running");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use powerfm_relay::process::ProcessHandle;
    use std::sync::Arc;

    /// Launches `sh -c "exit 1"` (crash) or `sleep 30` (stays up)
    struct ScriptedLauncher {
        crash: bool,
        launches: Arc<AtomicUsize>,
    }

    impl StationLauncher for ScriptedLauncher {
        fn launch(&self, key: &str, _station: &StationConfig) -> Result<StationHandle, SupervisorError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(if self.crash { "exit 1" } else { "exec sleep 30" });
            cmd.kill_on_drop(true);
            let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
                key: key.to_string(),
                source,
            })?;
            Ok(StationHandle::Owned(ProcessHandle::watch(key, child)))
        }
    }

    /// Probe answers from a per-port table, default failure
    #[derive(Default)]
    struct ScriptedProbe {
        serving: Mutex<HashMap<u16, bool>>,
    }

    impl StatusProbe for ScriptedProbe {
        async fn probe(&self, port: u16) -> ProbeResult {
            if self.serving.lock().unwrap().get(&port).copied().unwrap_or(false) {
                ProbeResult::success(200)
            } else {
                ProbeResult::failure(None, "connection refused")
            }
        }
    }

    fn config(dir: &std::path::Path) -> SupervisorConfig {
        let json = format!(
            r#"{{
                "stations": {{
                    "nyc": {{ "name": "Power 105.1 NYC", "market": "New York", "port": 8002, "source": "http://icecast/nyc" }}
                }},
                "max_restarts": 3,
                "restart_window_secs": 300,
                "state_file": "{}"
            }}"#,
            dir.join("state.json").display()
        );
        SupervisorConfig::from_json(&json).unwrap()
    }

    async fn supervisor(
        dir: &std::path::Path,
        crash: bool,
    ) -> (StationSupervisor<ScriptedLauncher, ScriptedProbe>, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        let launcher = ScriptedLauncher {
            crash,
            launches: Arc::clone(&launches),
        };
        let sup = StationSupervisor::new(&config(dir), launcher, ScriptedProbe::default()).await;
        (sup, launches)
    }

    #[tokio::test]
    async fn test_restart_storm_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, launches) = supervisor(dir.path(), true).await;

        let mut actions = Vec::new();
        for _ in 0..4 {
            let check = sup.check_station("nyc", true, Instant::now()).await.unwrap();
            assert_eq!(check.health, StationHealth::Down);
            actions.push(check.action);
            // Let the crashing child exit before the next cycle
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        assert_eq!(
            actions,
            vec![
                Some(RestartAction::Restarted),
                Some(RestartAction::Restarted),
                Some(RestartAction::Restarted),
                Some(RestartAction::RestartSuppressed),
            ]
        );
        assert_eq!(launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_window_expiry_allows_restart_again() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, launches) = supervisor(dir.path(), true).await;
        let start = Instant::now();

        for i in 0..3 {
            sup.check_station("nyc", true, start + Duration::from_secs(i)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let suppressed = sup
            .check_station("nyc", true, start + Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(suppressed.action, Some(RestartAction::RestartSuppressed));
        assert_eq!(suppressed.restarts, 3);

        let later = sup
            .check_station("nyc", true, start + Duration::from_secs(301))
            .await
            .unwrap();
        assert_eq!(later.action, Some(RestartAction::Restarted));
        assert_eq!(launches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_healthy_and_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, launches) = supervisor(dir.path(), false).await;

        let pid = sup.start_station("nyc").await.unwrap();
        assert!(pid.is_some());
        assert!(matches!(
            sup.start_station("nyc").await,
            Err(SupervisorError::AlreadyRunning { .. })
        ));

        // Alive but not serving
        let check = sup.check_station("nyc", true, Instant::now()).await.unwrap();
        assert_eq!(check.health, StationHealth::Degraded);
        assert_eq!(check.action, None);

        sup.probe.serving.lock().unwrap().insert(8002, true);
        let check = sup.check_station("nyc", true, Instant::now()).await.unwrap();
        assert_eq!(check.health, StationHealth::Healthy);
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        let info = sup.list();
        assert_eq!(info[0].recent, vec![StationHealth::Degraded, StationHealth::Healthy]);

        assert!(sup.stop_station("nyc").await.unwrap());
        assert!(!sup.is_running("nyc").await.unwrap());
        assert!(!sup.stop_station("nyc").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_mode_never_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, launches) = supervisor(dir.path(), false).await;

        let report = sup.run_cycle(false).await;
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].action, Some(RestartAction::NoRestartRequested));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_adopts_live_pid_and_clears_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(
            dir.path().join("state.json"),
            format!(r#"{{"stations": {{"nyc": {}, "gone": 999999}}}}"#, sleeper.id()),
        )
        .unwrap();

        let (mut sup, launches) = supervisor(dir.path(), false).await;
        assert!(sup.is_running("nyc").await.unwrap());
        assert_eq!(sup.list()[0].pid, Some(sleeper.id()));

        let state = PidStateFile::load(&dir.path().join("state.json")).await;
        assert_eq!(state.get("nyc"), Some(sleeper.id()));
        assert!(state.get("gone").is_none());

        // Adopted station counts as running: no double launch
        assert!(sup.start_station("nyc").await.is_err());
        assert_eq!(launches.load(Ordering::SeqCst), 0);

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
        assert!(!sup.is_running("nyc").await.unwrap());
        let state = PidStateFile::load(&dir.path().join("state.json")).await;
        assert!(state.get("nyc").is_none());
    }

    #[tokio::test]
    async fn test_unknown_station() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, _) = supervisor(dir.path(), false).await;
        assert!(matches!(
            sup.start_station("miami").await,
            Err(SupervisorError::UnknownStation(_))
        ));
    }
}
