//! Operator binary

use async_trait::async_trait;
use cfdi_coord::collab::{FileStore, HttpProber, LogNotifier, PacClient, PacStamp};
use cfdi_coord::coordinator::{Branch, Certificate};
use cfdi_coord::{Collaborators, Config, Coordinator, Error};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cfdi-coord")]
#[command(about = "Multi-branch CFDI stamping coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Validate {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print branches, certificates and remaining folios
    Status {
        #[arg(long)]
        config: PathBuf,

        /// JSON state file (defaults to store.path from the config)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Probe every branch once before reporting
        #[arg(long)]
        probe: bool,

        /// Also print engine metrics in Prometheus text format
        #[arg(long)]
        metrics: bool,
    },

    /// Run health probes until interrupted; SIGHUP reloads the config
    Monitor {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Append notifications to this JSONL file
        #[arg(long)]
        events: Option<PathBuf>,
    },
}

/// The monitor never stamps; any attempt is refused
struct NoPac;

#[async_trait]
impl PacClient for NoPac {
    async fn stamp(
        &self,
        branch: &Branch,
        _certificate: &Certificate,
        _payload: &[u8],
        _timeout: Duration,
    ) -> cfdi_coord::Result<PacStamp> {
        Err(Error::Pac(format!(
            "no PAC client configured (branch {})",
            branch.code
        )))
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build(config: &Config, store: Option<&Path>, events: Option<&Path>) -> anyhow::Result<Coordinator> {
    let store_path = store.unwrap_or(config.store.path.as_path());
    let store = Arc::new(FileStore::open(store_path)?);
    let notifier = match events {
        Some(path) => LogNotifier::with_file(path),
        None => LogNotifier::new(),
    };
    let collab = Collaborators {
        store,
        prober: Arc::new(HttpProber::new(config.health.probe_timeout)?),
        pac: Arc::new(NoPac),
        notifier: Arc::new(notifier),
    };
    Ok(Coordinator::new(config.clone(), collab)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let cfg = Config::load(&config)?;
            init_tracing(&cfg.log_level);
            println!("✓ {} is valid", config.display());
            for group in &cfg.groups {
                println!(
                    "  group {:<12} members={} primary={} backups={} balancing={:?}",
                    group.id,
                    group.members.join(","),
                    group.primary.as_deref().unwrap_or("-"),
                    if group.backups.is_empty() {
                        "-".to_string()
                    } else {
                        group.backups.join(",")
                    },
                    group.balancing,
                );
            }
            println!("  customers: {}", cfg.customers.len());
        }

        Commands::Status {
            config,
            store,
            probe,
            metrics,
        } => {
            let cfg = Config::load(&config)?;
            init_tracing(&cfg.log_level);
            let coord = build(&cfg, store.as_deref(), None)?;
            if probe {
                coord.probe_all().await;
            }
            for report in coord.branch_report()? {
                println!(
                    "{} ({}) group={} primary={} status={} available={}",
                    report.code,
                    report.name,
                    report.group,
                    report.is_primary,
                    report.status,
                    report.available
                );
                for cert in &report.certificates {
                    println!(
                        "  cert {} expires {} [{}]",
                        cert.serial,
                        cert.not_after.format("%Y-%m-%d"),
                        cert.status
                    );
                }
                for series in &report.series {
                    println!(
                        "  series {} remaining {}/{}",
                        series.series, series.remaining, series.limit
                    );
                }
            }
            if metrics {
                print!("{}", coord.metrics().render_prometheus());
            }
        }

        Commands::Monitor {
            config,
            store,
            events,
        } => {
            let cfg = Config::load(&config)?;
            init_tracing(&cfg.log_level);
            let coord = build(&cfg, store.as_deref(), events.as_deref())?;
            coord.start();
            tracing::info!("cfdi-coord {} monitoring {}", cfdi_coord::VERSION, config.display());

            run_monitor(&coord, &config).await?;
            coord.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn run_monitor(coord: &Coordinator, config_path: &Path) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut ticker = tokio::time::interval(coord.config().health.interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
            _ = hangup.recv() => {
                match Config::load(config_path).and_then(|cfg| coord.reload(cfg)) {
                    Ok(()) => tracing::info!("reloaded {}", config_path.display()),
                    Err(e) => tracing::error!("reload failed, keeping previous config: {}", e),
                }
            }
            _ = ticker.tick() => log_summary(coord),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_monitor(coord: &Coordinator, _config_path: &Path) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(coord.config().health.interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => log_summary(coord),
        }
    }
    Ok(())
}

fn log_summary(coord: &Coordinator) {
    let snapshot = coord.health_snapshot();
    let available = snapshot.iter().filter(|r| r.available).count();
    let purged = coord.purge_expired();
    tracing::info!(
        available,
        known = snapshot.len(),
        purged,
        uptime_secs = coord.metrics().uptime_seconds(),
        "health summary"
    );
}
