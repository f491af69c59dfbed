//! Host metrics for relay heartbeats
//!
//! Provides:
//! - CPU temperature (thermal zone, sysinfo components as fallback)
//! - CPU usage since the previous sample
//! - Memory usage

use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::{Components, System};
use tracing::debug;

/// Raspberry Pi SoC sensor, millidegrees Celsius
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// One heartbeat's worth of host readings
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HostMetrics {
    pub cpu_temp: Option<f32>,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
}

/// Keeps a `System` alive between samples so CPU usage is a delta
pub struct MetricsCollector {
    sys: System,
    thermal_zone: PathBuf,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys,
            thermal_zone: PathBuf::from(THERMAL_ZONE),
        }
    }

    #[cfg(test)]
    fn with_thermal_zone(path: &Path) -> Self {
        let mut collector = Self::new();
        collector.thermal_zone = path.to_path_buf();
        collector
    }

    pub fn collect(&mut self) -> HostMetrics {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu_usage = Some(self.sys.global_cpu_info().cpu_usage());

        let total = self.sys.total_memory();
        let memory_usage = if total > 0 {
            let used = total.saturating_sub(self.sys.available_memory());
            Some(used as f32 / total as f32 * 100.0)
        } else {
            None
        };

        let cpu_temp = read_thermal_zone(&self.thermal_zone).or_else(component_temperature);

        let metrics = HostMetrics {
            cpu_temp,
            cpu_usage,
            memory_usage,
        };
        debug!("Host metrics: {:?}", metrics);
        metrics
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn read_thermal_zone(path: &Path) -> Option<f32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let millidegrees: f32 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

fn component_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    let temps: Vec<f32> = components
        .iter()
        .filter(|c| {
            let label = c.label().to_ascii_lowercase();
            label.contains("cpu") || label.contains("core") || label.contains("soc")
        })
        .map(|c| c.temperature())
        .filter(|t| t.is_finite() && *t > 0.0)
        .collect();
    temps.into_iter().reduce(f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thermal_zone_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "48312\n").unwrap();
        let temp = read_thermal_zone(&path).unwrap();
        assert!((temp - 48.312).abs() < 1e-3);

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_thermal_zone(&path).is_none());
        assert!(read_thermal_zone(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_collect_uses_thermal_zone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "61000").unwrap();

        let mut collector = MetricsCollector::with_thermal_zone(&path);
        let metrics = collector.collect();
        assert_eq!(metrics.cpu_temp, Some(61.0));
        let memory = metrics.memory_usage.unwrap();
        assert!((0.0..=100.0).contains(&memory));
        assert!(metrics.cpu_usage.is_some());
    }
}
