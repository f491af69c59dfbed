//! Local station supervisor
//!
//! Keeps one `powerfm-relay` per configured station alive on this host:
//! one-shot checks, start/stop, and a daemon loop with bounded restarts.

mod config;
mod error;
mod launcher;
mod probe;
mod state;
mod supervisor;
mod table;
mod window;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use powerfm_relay::shutdown::install_shutdown_handler;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::RelayLauncher;
use crate::probe::HttpStatusProbe;
use crate::supervisor::StationSupervisor;

#[derive(Parser, Debug)]
#[command(name = "powerfm-supervisor", version, about = "Power FM station supervisor")]
struct Cli {
    /// Station table (default: $POWERFM_SUPERVISOR_CONFIG, then stations.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One check cycle, restarting stations that are down
    Check,
    /// One check cycle, report only
    Status,
    /// Start stations (`all` or comma-separated keys)
    Start { stations: String },
    /// Stop stations (`all` or comma-separated keys)
    Stop { stations: String },
    /// Print the station table
    List,
    /// Check periodically until SIGINT/SIGTERM
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = SupervisorConfig::resolve_path(cli.config);
    let config = SupervisorConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load station table {}", config_path.display()))?;

    let launcher = RelayLauncher::new(config.relay_binary.clone(), config.log_dir.clone());
    let probe = HttpStatusProbe::new(config.probe_timeout()).context("Failed to build HTTP probe")?;
    let mut supervisor = StationSupervisor::new(&config, launcher, probe).await;

    match cli.command {
        Command::Check => run_once(&mut supervisor, true).await,
        Command::Status => run_once(&mut supervisor, false).await,
        Command::Start { stations } => {
            let mut failures = 0;
            for key in config.resolve_keys(&stations)? {
                match supervisor.start_station(&key).await {
                    Ok(pid) => info!("✅ {} started (pid {:?})", key, pid),
                    Err(SupervisorError::AlreadyRunning { pid, .. }) => {
                        info!("{} already running (pid {:?})", key, pid)
                    }
                    Err(e) => {
                        error!("❌ {}", e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{} station(s) failed to start", failures);
            }
        }
        Command::Stop { stations } => {
            for key in config.resolve_keys(&stations)? {
                if supervisor.stop_station(&key).await? {
                    info!("🛑 {} stopped", key);
                } else {
                    info!("{} was not running", key);
                }
            }
        }
        Command::List => {
            for station in supervisor.list() {
                println!(
                    "{:<12} {:<24} {:<14} port {:<5} {}",
                    station.key,
                    station.name,
                    station.market.as_deref().unwrap_or("-"),
                    station.port,
                    match station.pid {
                        Some(pid) if station.running => format!("running (pid {})", pid),
                        _ => "stopped".to_string(),
                    }
                );
            }
        }
        Command::Daemon => {
            let cancel = install_shutdown_handler();
            supervisor.run_daemon(cancel).await;
        }
    }

    Ok(())
}

/// Exit code: 0 all healthy, 1 degraded, 2 down
async fn run_once(supervisor: &mut StationSupervisor<RelayLauncher, HttpStatusProbe>, allow_restart: bool) {
    let report = supervisor.run_cycle(allow_restart).await;
    println!("{}", report.render());
    std::process::exit(report.exit_code());
}
