use std::fmt::Write as _;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::FleetConfig;
use crate::models::{Alert, NodeStatus, RelayNode};
use crate::scan::{assess_node, LAST_SCAN_KEY};
use crate::store::{FleetError, FleetRepository};

/// "just now", "5 min ago", "3 hr ago", "2 days ago"
pub fn format_ago(now: OffsetDateTime, at: Option<OffsetDateTime>) -> String {
    let Some(at) = at else {
        return "never".to_string();
    };
    let minutes = (now - at).whole_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{} min ago", minutes)
    } else if minutes < 1440 {
        format!("{} hr ago", minutes / 60)
    } else {
        format!("{} days ago", minutes / 1440)
    }
}

fn frequency(node: &RelayNode) -> String {
    node.fm_frequency
        .map(|f| format!("{:.1}", f))
        .unwrap_or_else(|| "-".to_string())
}

fn alert_line(alert: &Alert) -> String {
    format!(
        "[{}] {}: {}",
        alert.severity.as_str().to_uppercase(),
        alert.node_id.as_deref().unwrap_or("fleet"),
        alert.message
    )
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

/// Tableau des nœuds suivi des alertes actives
pub fn render_node_list(repo: &dyn FleetRepository, now: OffsetDateTime) -> Result<String, FleetError> {
    let nodes = repo.list_nodes()?;
    let mut out = String::new();
    if nodes.is_empty() {
        let _ = writeln!(out, "No relay nodes registered.");
        let _ = writeln!(
            out,
            "Add one with: powerfm-fleet add-node <node-id> --name <name> --market <market> --frequency <mhz>"
        );
        return Ok(out);
    }

    let _ = writeln!(out, "=== FM Relay Fleet: {} node(s) ===", nodes.len());
    let _ = writeln!(
        out,
        "  {:<12} {:<20} {:<14} {:<7} {:<11} {:<9} {}",
        "NODE", "NAME", "MARKET", "FREQ", "TYPE", "STATUS", "LAST HB"
    );
    let _ = writeln!(out, "  {}", "-".repeat(90));
    for node in &nodes {
        let _ = writeln!(
            out,
            "  {:<12} {:<20} {:<14} {:<7} {:<11} {:<9} {}",
            node.node_id,
            node.name,
            node.market,
            frequency(node),
            node.transmitter_type.as_str(),
            node.status.as_str(),
            format_ago(now, node.last_heartbeat)
        );
    }

    let alerts = repo.active_alerts(None)?;
    if !alerts.is_empty() {
        let _ = writeln!(out, "\n--- Active Alerts ({}) ---", alerts.len());
        for alert in &alerts {
            let _ = writeln!(out, "  {}", alert_line(alert));
        }
    }
    Ok(out)
}

/// Rapport de flotte complet (vue d'ensemble, nœuds, alertes, historique)
pub fn render_fleet_report(
    repo: &dyn FleetRepository,
    config: &FleetConfig,
    now: OffsetDateTime,
) -> Result<String, FleetError> {
    let stats = repo.fleet_stats()?;
    let nodes = repo.list_nodes()?;
    let mut out = String::new();

    let _ = writeln!(out, "FM TRANSMITTER FLEET REPORT  {}", format_time(now));
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Total nodes: {}", stats.total_nodes);
    let _ = writeln!(
        out,
        "Online: {} | Degraded: {} | Offline: {} | New: {}",
        stats.nodes_online, stats.nodes_degraded, stats.nodes_offline, stats.nodes_new
    );
    let _ = writeln!(out, "Active FM transmitters: {}", stats.nodes_transmitting);
    let _ = writeln!(out, "Markets covered: {}", stats.markets);
    let _ = writeln!(
        out,
        "Active alerts: {} ({} critical)",
        stats.active_alerts, stats.critical_alerts
    );

    if !nodes.is_empty() {
        let _ = writeln!(out, "\nNODE STATUS");
        for node in &nodes {
            let marker = match node.status {
                NodeStatus::Online => "OK",
                NodeStatus::Degraded => "!!",
                NodeStatus::Offline => "XX",
                NodeStatus::New => "--",
            };
            let _ = writeln!(
                out,
                "  [{}] {:<12} {:<20} {:<14} {:>6} MHz  {:<11} {}",
                marker,
                node.node_id,
                node.name,
                node.market,
                frequency(node),
                node.transmitter_type.as_str(),
                format_ago(now, node.last_heartbeat)
            );
        }
    }

    for node in &nodes {
        let latest = repo.latest_heartbeat(&node.node_id)?;
        let health = assess_node(node, latest.as_ref(), config, now);
        let Some(hb) = &health.heartbeat else {
            continue;
        };
        let na = |v: Option<f32>, unit: &str| v.map_or("N/A".to_string(), |v| format!("{:.1}{}", v, unit));
        let _ = writeln!(out, "\n{} ({})", node.name, node.node_id);
        let _ = writeln!(out, "  Stream connected: {}", if hb.stream_connected { "yes" } else { "no" });
        let _ = writeln!(out, "  FM transmitting:  {}", if hb.fm_transmitting { "yes" } else { "no" });
        let _ = writeln!(out, "  CPU temp:  {}", na(hb.cpu_temp, "°C"));
        let _ = writeln!(out, "  CPU usage: {}", na(hb.cpu_usage, "%"));
        let _ = writeln!(out, "  Memory:    {}", na(hb.memory_usage, "%"));
        let _ = writeln!(
            out,
            "  Uptime:    {}h {}m",
            hb.uptime_seconds / 3600,
            (hb.uptime_seconds % 3600) / 60
        );
        let _ = writeln!(
            out,
            "  Buffer health: {}",
            hb.buffer_health.map_or("N/A".to_string(), |b| format!("{:.2}", b))
        );
        if !health.issues.is_empty() {
            let _ = writeln!(out, "  Issues:");
            for issue in &health.issues {
                let _ = writeln!(out, "    - {}", issue);
            }
        }
    }

    let active = repo.active_alerts(None)?;
    if !active.is_empty() {
        let _ = writeln!(out, "\nACTIVE ALERTS");
        for alert in &active {
            let _ = writeln!(out, "  {} (since {})", alert_line(alert), format_time(alert.created_at));
        }
    }

    let recent = repo.recent_alerts(20)?;
    if !recent.is_empty() {
        let _ = writeln!(out, "\nRECENT ALERT HISTORY");
        for alert in &recent {
            let message: String = alert.message.chars().take(50).collect();
            let _ = writeln!(
                out,
                "  {}  {:<8} {:<12} {:<20} {:<50} {}",
                format_time(alert.created_at),
                alert.severity.as_str(),
                alert.node_id.as_deref().unwrap_or("fleet"),
                alert.alert_type,
                message,
                alert.resolved_at.map_or("open".to_string(), format_time)
            );
        }
    }

    let last_scan = repo.get_state(LAST_SCAN_KEY)?.unwrap_or_else(|| "never".to_string());
    let _ = writeln!(out, "\nLast fleet scan: {}", last_scan);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Severity, ALERT_OVERHEATING};
    use crate::scan::scan_at;
    use crate::store::tests::{heartbeat, registration};
    use crate::store::tests::temp_store;
    use time::Duration;

    #[test]
    fn test_format_ago() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(format_ago(now, None), "never");
        assert_eq!(format_ago(now, Some(now - Duration::seconds(20))), "just now");
        assert_eq!(format_ago(now, Some(now - Duration::minutes(5))), "5 min ago");
        assert_eq!(format_ago(now, Some(now - Duration::hours(3))), "3 hr ago");
        assert_eq!(format_ago(now, Some(now - Duration::days(2))), "2 days ago");
    }

    #[test]
    fn test_empty_fleet_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let out = render_node_list(&store, OffsetDateTime::now_utc()).unwrap();
        assert!(out.contains("No relay nodes registered."));
    }

    #[test]
    fn test_report_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = FleetConfig::default();
        let now = OffsetDateTime::now_utc();

        store.upsert_node(registration("la-01", "Los Angeles")).unwrap();
        store
            .record_heartbeat(
                crate::models::Heartbeat {
                    cpu_temp: Some(85.0),
                    ..heartbeat("la-01", now)
                },
                None,
            )
            .unwrap();
        scan_at(&store, &config, now).unwrap();
        assert!(store.find_open_alert(ALERT_OVERHEATING, Some("la-01")).unwrap().is_some());

        let listing = render_node_list(&store, now).unwrap();
        assert!(listing.contains("la-01"));
        assert!(listing.contains("[CRITICAL] la-01"));

        let report = render_fleet_report(&store, &config, now).unwrap();
        assert!(report.contains("Total nodes: 1"));
        assert!(report.contains("Active FM transmitters: 1"));
        assert!(report.contains("CPU temp critical: 85.0°C"));
        assert!(report.contains("ACTIVE ALERTS"));
        assert!(report.contains(Severity::Critical.as_str()));
        assert!(!report.contains("Last fleet scan: never"));
    }
}
