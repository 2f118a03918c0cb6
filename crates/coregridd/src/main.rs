//! coregridd — the coregrid daemon.
//!
//! Single binary that assembles the coregrid subsystems:
//! - Cluster configuration (`coregrid.toml`)
//! - Placement engine
//! - Step accounting with its profile timer
//! - REST API
//!
//! # Usage
//!
//! ```text
//! coregridd standalone --config /etc/coregrid/coregrid.toml --port 6820
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use coregrid_acct::{
    Capabilities, LocalControl, LustreStats, OfedCounters, ProfileTimer, RaplEnergy, StepManager, TracingSink,
    Tracking,
};
use coregrid_core::ClusterConfig;
use coregrid_select::SelectEngine;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "coregridd", about = "coregrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run placement, accounting and the API in one process.
    Standalone {
        /// Cluster configuration file.
        #[arg(long, default_value = "/etc/coregrid/coregrid.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "6820")]
        port: u16,

        /// Track step processes through this cgroup root instead of by
        /// process group.
        #[arg(long)]
        cgroup_root: Option<PathBuf>,

        /// Sample node energy from RAPL.
        #[arg(long)]
        energy_rapl: bool,

        /// Sample Lustre client counters.
        #[arg(long)]
        lustre: bool,

        /// Sample InfiniBand port counters.
        #[arg(long)]
        ofed: bool,
    },

    /// Parse a configuration file and print it back.
    CheckConfig {
        #[arg(long, default_value = "/etc/coregrid/coregrid.toml")]
        config: PathBuf,
    },
}

struct StandaloneOpts {
    config: PathBuf,
    port: u16,
    cgroup_root: Option<PathBuf>,
    energy_rapl: bool,
    lustre: bool,
    ofed: bool,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new("info,coregrid=debug")?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Standalone {
            config,
            port,
            cgroup_root,
            energy_rapl,
            lustre,
            ofed,
        } => {
            run_standalone(StandaloneOpts {
                config,
                port,
                cgroup_root,
                energy_rapl,
                lustre,
                ofed,
            })
            .await
        }
        Command::CheckConfig { config } => {
            let cfg = ClusterConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("{}", cfg.to_toml_string()?);
            Ok(())
        }
    }
}

fn capabilities(cfg: &ClusterConfig, opts: &StandaloneOpts) -> Capabilities {
    let acct = &cfg.acct_gather;
    let mut caps = Capabilities::none();
    if opts.energy_rapl {
        caps.energy = Some(Box::new(RaplEnergy::new(&acct.sysfs_root)));
    }
    if opts.lustre {
        caps.filesystem = Some(Box::new(LustreStats::new(&acct.proc_root)));
    }
    if opts.ofed {
        caps.interconnect = Some(Box::new(OfedCounters::new(&acct.sysfs_root)));
    }
    caps
}

async fn run_standalone(opts: StandaloneOpts) -> anyhow::Result<()> {
    info!("coregrid daemon starting in standalone mode");

    let cfg = ClusterConfig::from_file(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;
    info!(path = ?opts.config, nodes = cfg.nodes.len(), partitions = cfg.partitions.len(), "configuration loaded");

    // ── Initialize subsystems ──────────────────────────────────

    let engine = Arc::new(SelectEngine::from_config(&cfg)?);
    info!(nodes = engine.inventory().node_count(), "placement engine initialized");

    let (steps, options) = StepManager::from_config(
        &cfg.acct_gather,
        capabilities(&cfg, &opts),
        Arc::new(LocalControl),
    )?;
    let timer = ProfileTimer::new();
    let mut steps = steps.with_sink(Arc::new(TracingSink)).with_timer(timer.clone());
    if let Some(root) = &opts.cgroup_root {
        steps = steps.with_tracking(Tracking::Cgroup { root: root.clone() });
    }
    let steps = Arc::new(steps);
    info!(frequency_secs = options.frequency_secs, "step accounting initialized");

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let timer_handle = (options.frequency_secs > 0).then(|| timer.start(Duration::from_secs(options.frequency_secs)));

    let accounting = steps.clone();
    let accounting_handle = tokio::spawn(async move {
        let _ = shutdown_rx.changed().await;
        accounting.end_poll();
    });

    // ── Start API server ───────────────────────────────────────

    let router = coregrid_api::build_router(engine, steps);
    let addr = SocketAddr::from(([0, 0, 0, 0], opts.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "no CTRL+C handler; shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = accounting_handle.await;
    timer.shutdown();
    if let Some(handle) = timer_handle {
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
    }

    info!("coregrid daemon stopped");
    Ok(())
}
