/**
 * POWER FM FLEET - Registre central des relais FM
 *
 * RÔLE : Orchestration du registre : config, store SQLite, scan, HTTP, MQTT.
 * Commandes opérateur ponctuelles ou mode daemon.
 *
 * ARCHITECTURE : Store partagé (Arc<dyn FleetRepository>) + API REST + listener MQTT
 * + boucle de scan pilotée par interval et CancellationToken.
 * UTILITÉ : Vue santé de toute la flotte, alertes ouvertes/résolues automatiquement.
 */

mod config;
mod http;
mod ingest;
mod models;
mod mqtt;
mod report;
mod scan;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::FleetConfig;
use crate::http::AppState;
use crate::ingest::SharedRepository;
use crate::models::{NodeRegistration, TransmitterType};
use crate::store::{FleetRepository, SqliteFleetStore};

#[derive(Parser, Debug)]
#[command(name = "powerfm-fleet", version, about = "Power FM relay fleet registry")]
struct Cli {
    /// Fleet config (default: $POWERFM_FLEET_CONFIG, then fleet.config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every node once, opening and resolving alerts
    Scan,
    /// List registered nodes and active alerts
    ListNodes,
    /// Print the fleet report
    Report,
    /// Register or update a relay node
    AddNode {
        node_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "national")]
        market: String,
        /// FM frequency in MHz
        #[arg(long)]
        frequency: Option<f64>,
        #[arg(long)]
        stream_url: Option<String>,
        #[arg(long, default_value = "simulated")]
        transmitter_type: TransmitterType,
        #[arg(long)]
        hardware: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a node with its heartbeats and alerts
    RemoveNode { node_id: String },
    /// Scan loop + HTTP ingestion + MQTT listener until SIGINT/SIGTERM
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = config::resolve_path(cli.config);
    let cfg = config::load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load fleet config {}", config_path.display()))?;
    let store = SqliteFleetStore::open(&cfg.data_file)
        .with_context(|| format!("Failed to open fleet data {}", cfg.data_file.display()))?;
    let repo: SharedRepository = Arc::new(store);
    let now = OffsetDateTime::now_utc();

    match cli.command {
        Some(Command::Scan) => {
            let scan = scan::scan_at(repo.as_ref(), &cfg, now)?;
            println!("{}", scan.render());
        }
        Some(Command::ListNodes) => print!("{}", report::render_node_list(repo.as_ref(), now)?),
        Some(Command::Report) => print!("{}", report::render_fleet_report(repo.as_ref(), &cfg, now)?),
        Some(Command::AddNode {
            node_id,
            name,
            market,
            frequency,
            stream_url,
            transmitter_type,
            hardware,
            notes,
        }) => {
            if repo.get_node(&node_id)?.is_some() {
                println!("Node '{}' already exists, updating", node_id);
            }
            let node = repo.upsert_node(NodeRegistration {
                name: name.unwrap_or_else(|| node_id.clone()),
                node_id,
                market,
                stream_url,
                fm_frequency: frequency,
                transmitter_type,
                hardware,
                notes,
            })?;
            println!("Node registered: {} ({})", node.node_id, node.name);
            println!("  Market: {}", node.market);
            if let Some(f) = node.fm_frequency {
                println!("  FM frequency: {:.1} MHz", f);
            }
            if let Some(url) = &node.stream_url {
                println!("  Stream URL: {}", url);
            }
            println!("  Transmitter: {}", node.transmitter_type);
            println!("  Status: {}", node.status.as_str());
        }
        Some(Command::RemoveNode { node_id }) => {
            let node = repo.remove_node(&node_id)?;
            println!("Removed node: {} ({})", node.node_id, node.name);
        }
        Some(Command::Daemon) => run_daemon(repo, cfg).await?,
        None => {
            // Par défaut : liste + scan
            print!("{}", report::render_node_list(repo.as_ref(), now)?);
            let scan = scan::scan_at(repo.as_ref(), &cfg, now)?;
            println!("--- Scan Results ---\n{}", scan.render());
        }
    }

    Ok(())
}

async fn run_daemon(repo: SharedRepository, cfg: FleetConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    let listener = TcpListener::bind(&cfg.http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.http_bind))?;
    let app_state = AppState {
        repo: repo.clone(),
        config: Arc::new(cfg.clone()),
    };
    let server = tokio::spawn(http::serve(listener, app_state, cancel.clone()));

    let mqtt = cfg
        .mqtt
        .clone()
        .map(|conf| mqtt::spawn_mqtt_listener(repo.clone(), conf, cancel.clone()));
    if mqtt.is_none() {
        info!("No MQTT broker configured, HTTP ingestion only");
    }

    info!(
        "FM fleet registry starting in daemon mode (scan every {}s)",
        cfg.poll_interval
    );
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(cfg.poll_interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                // Rapport au démarrage puis tous les N cycles
                let with_report = cfg.report_every_cycles > 0 && cycle % cfg.report_every_cycles == 0;
                let (repo, cfg) = (repo.clone(), cfg.clone());
                if let Err(e) = tokio::task::spawn_blocking(move || scan_cycle(repo.as_ref(), &cfg, with_report)).await {
                    error!("Fleet scan task failed: {}", e);
                }
                cycle += 1;
            }
        }
    }

    match server.await {
        Ok(Err(e)) => warn!("HTTP server error: {}", e),
        Err(e) => warn!("HTTP task ended abnormally: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = mqtt {
        let _ = handle.await;
    }
    info!("FM fleet registry stopped.");
    Ok(())
}

/// Un passage de scan, suivi du rapport si demandé
fn scan_cycle(repo: &dyn FleetRepository, cfg: &FleetConfig, with_report: bool) {
    let now = OffsetDateTime::now_utc();
    if let Err(e) = scan::scan_at(repo, cfg, now) {
        error!("Fleet scan failed: {}", e);
    }
    if !with_report {
        return;
    }
    match report::render_fleet_report(repo, cfg, now) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            error!("Fleet report failed: {}", e);
            return;
        }
    }
    if let Ok(stamp) = now.format(&Rfc3339) {
        if let Err(e) = repo.set_state("last_report_timestamp", &stamp) {
            warn!("Failed to record report time: {}", e);
        }
    }
}

/// SIGINT / SIGTERM → annulation
fn spawn_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut s) => {
                    s.recv().await;
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, finishing current cycle..."),
            _ = sigterm => info!("Received SIGTERM, finishing current cycle..."),
        }
        cancel.cancel();
    });
}
