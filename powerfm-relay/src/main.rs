//! Power FM relay node binary
//!
//! Wires config → transmitter → pipeline, then runs the heartbeat reporter
//! and the status endpoint until SIGINT/SIGTERM. Exits non-zero when the
//! transmitter dies so the station supervisor restarts the relay.

use anyhow::{Context, Result};
use clap::Parser;
use powerfm_relay::heartbeat::{HeartbeatReporter, HeartbeatSink};
use powerfm_relay::pipeline::SourceKind;
use powerfm_relay::shutdown::install_shutdown_handler;
use powerfm_relay::status::{self, StatusState};
use powerfm_relay::{RelayConfig, StreamPipeline, Transmitter, TransmitterKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TRANSMITTER_WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "powerfm-relay", version, about = "Power FM relay node")]
struct Cli {
    /// Config file (default: $POWERFM_RELAY_CONFIG, then relay.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the transmitter backend
    #[arg(long)]
    transmitter: Option<TransmitterKind>,

    /// Synthetic tone instead of the network stream, simulated transmitter
    #[arg(long)]
    standalone: bool,

    /// Override the fleet hub URL
    #[arg(long)]
    hub_url: Option<String>,

    /// Override the status endpoint port
    #[arg(long)]
    status_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = RelayConfig::resolve_path(cli.config);
    let mut config = RelayConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load relay config {}", config_path.display()))?;

    if cli.standalone {
        config.transmitter_type = TransmitterKind::Simulated;
        if config.source == SourceKind::Ffmpeg {
            config.source = SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs: None,
            };
        }
    }
    if let Some(kind) = cli.transmitter {
        config.transmitter_type = kind;
    }
    if let Some(hub_url) = cli.hub_url {
        config.hub_url = Some(hub_url);
    }
    if let Some(port) = cli.status_port {
        config.status_port = port;
    }

    info!(
        "📻 Power FM relay {} ({}) starting: {:.1} MHz via {}",
        config.node_id,
        config.market,
        config.fm_frequency,
        config.transmitter_type
    );

    let cancel = install_shutdown_handler();
    let started = Instant::now();

    let transmitter = Arc::new(Transmitter::from_config(
        config.transmitter_type,
        config.fm_frequency,
        &config.transmitter_options,
    ));
    let pipeline = Arc::new(StreamPipeline::new(
        config.pipeline_config(),
        Arc::clone(&transmitter),
    ));
    pipeline
        .start()
        .await
        .context("Failed to start relay pipeline")?;

    let listener = status::bind(config.status_port).await?;
    let status_state = StatusState {
        node_id: config.node_id.clone(),
        pipeline: Arc::clone(&pipeline),
        started,
    };
    let status_task = tokio::spawn(status::serve(listener, status_state, cancel.clone()));

    let sink = HeartbeatSink::from_config(&config, cancel.clone())?;
    let reporter = HeartbeatReporter::new(&config, Arc::clone(&pipeline), sink);
    let reporter_task = tokio::spawn(reporter.run(cancel.clone()));

    let transmitter_failed = watch_transmitter(&transmitter, &cancel).await;

    cancel.cancel();
    pipeline.stop().await;
    if let Err(e) = reporter_task.await {
        warn!("Heartbeat task ended abnormally: {}", e);
    }
    match status_task.await {
        Ok(Err(e)) => warn!("{:#}", e),
        Err(e) => warn!("Status task ended abnormally: {}", e),
        Ok(Ok(())) => {}
    }

    if transmitter_failed {
        error!("Transmitter stopped unexpectedly, exiting for restart");
        std::process::exit(1);
    }
    info!("Relay stopped");
    Ok(())
}

/// Returns true when the transmitter died, false on shutdown
async fn watch_transmitter(transmitter: &Transmitter, cancel: &tokio_util::sync::CancellationToken) -> bool {
    let mut ticker = tokio::time::interval(TRANSMITTER_WATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {
                if !transmitter.is_transmitting() {
                    return true;
                }
            }
        }
    }
}
