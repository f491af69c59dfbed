use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::supervisor::{StationCheck, StationHealth};

/// Result of one check cycle over every station
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub checked_at: DateTime<Local>,
    pub checks: Vec<StationCheck>,
}

impl CycleReport {
    pub fn new(checks: Vec<StationCheck>) -> Self {
        Self {
            checked_at: Local::now(),
            checks,
        }
    }

    fn count(&self, health: StationHealth) -> usize {
        self.checks.iter().filter(|c| c.health == health).count()
    }

    /// 0 all healthy, 1 something degraded, 2 something down
    pub fn exit_code(&self) -> i32 {
        if self.count(StationHealth::Down) > 0 {
            2
        } else if self.count(StationHealth::Degraded) > 0 {
            1
        } else {
            0
        }
    }

    pub fn log_summary(&self) {
        let healthy = self.count(StationHealth::Healthy);
        let degraded = self.count(StationHealth::Degraded);
        let down = self.count(StationHealth::Down);
        if degraded + down == 0 {
            info!("✅ {}/{} stations healthy", healthy, self.checks.len());
        } else {
            warn!(
                "⚠️ {}/{} stations healthy ({} degraded, {} down)",
                healthy,
                self.checks.len(),
                degraded,
                down
            );
        }
    }

    /// Plain-text status table
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(86);

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(
            out,
            "  POWER FM STATION HEALTH    {}",
            self.checked_at.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(
            out,
            "  {:<22} {:>5}  {:<8} {:<20} {:<9} {:>8}  {}",
            "STATION", "PORT", "PROCESS", "PROBE", "STATUS", "RESTARTS", "ACTION"
        );
        let _ = writeln!(out, "  {}", "-".repeat(84));

        for check in &self.checks {
            let process = if check.liveness { "running" } else { "stopped" };
            let probe = match (&check.probe.status_code, &check.probe.error) {
                (Some(code), None) => format!("HTTP {}", code),
                (_, Some(error)) => error.clone(),
                (None, None) => "-".to_string(),
            };
            let action = check.action.map(|a| a.as_str()).unwrap_or("");
            let _ = writeln!(
                out,
                "  {:<22} {:>5}  {:<8} {:<20} {:<9} {:>8}  {}",
                truncate(&check.name, 22),
                check.port,
                process,
                truncate(&probe, 20),
                check.health.as_str().to_uppercase(),
                format!("{}/{}", check.restarts, check.max_restarts),
                action
            );
        }

        let _ = writeln!(out, "  {}", "-".repeat(84));
        let _ = writeln!(
            out,
            "  {} healthy, {} degraded, {} down",
            self.count(StationHealth::Healthy),
            self.count(StationHealth::Degraded),
            self.count(StationHealth::Down)
        );
        out
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let cut: String = value.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResult;
    use crate::supervisor::RestartAction;

    fn check(key: &str, health: StationHealth, action: Option<RestartAction>) -> StationCheck {
        let (liveness, probe) = match health {
            StationHealth::Healthy => (true, ProbeResult::success(200)),
            StationHealth::Degraded => (true, ProbeResult::failure(Some(503), "HTTP 503")),
            StationHealth::Down => (false, ProbeResult::failure(None, "connection refused")),
        };
        StationCheck {
            key: key.into(),
            name: format!("Power {}", key),
            port: 8000,
            pid: None,
            liveness,
            probe,
            health,
            action,
            restarts: 0,
            max_restarts: 3,
        }
    }

    #[test]
    fn test_exit_codes() {
        let all_ok = CycleReport::new(vec![check("la", StationHealth::Healthy, None)]);
        assert_eq!(all_ok.exit_code(), 0);

        let degraded = CycleReport::new(vec![
            check("la", StationHealth::Healthy, None),
            check("nyc", StationHealth::Degraded, None),
        ]);
        assert_eq!(degraded.exit_code(), 1);

        let down = CycleReport::new(vec![
            check("nyc", StationHealth::Degraded, None),
            check("chicago", StationHealth::Down, Some(RestartAction::Restarted)),
        ]);
        assert_eq!(down.exit_code(), 2);

        assert_eq!(CycleReport::new(vec![]).exit_code(), 0);
    }

    #[test]
    fn test_render_rows() {
        let report = CycleReport::new(vec![
            check("la", StationHealth::Healthy, None),
            check("nyc", StationHealth::Down, Some(RestartAction::RestartSuppressed)),
        ]);
        let table = report.render();
        assert!(table.contains("Power la"));
        assert!(table.contains("HEALTHY"));
        assert!(table.contains("connection refused"));
        assert!(table.contains("restart_suppressed"));
        assert!(table.contains("1 healthy, 0 degraded, 1 down"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long station name", 8), "a very …");
    }
}
