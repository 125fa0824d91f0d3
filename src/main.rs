use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use tcpagg::agent::Agent;
use tcpagg::config::Config;

/// Cluster-wide aggregator for kernel-traced TCP connection events.
#[derive(Parser)]
#[command(name = "tcpagg", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Rank of this node. Overrides `cluster.rank`, so one config file can
    /// serve every node.
    #[arg(long)]
    rank: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tcpagg {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(rank) = cli.rank {
        cfg.cluster.rank = rank;
        cfg.validate().context("applying --rank")?;
    }

    // Initialize tracing. fmt writes to stdout by default; summaries may go
    // there, so logs go to stderr.
    let log_level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        rank = cfg.cluster.rank,
        world_size = cfg.cluster.world_size,
        "starting tcpagg",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut agent: Agent = Agent::new(cfg)?;

    // Registration can wait on other nodes for a while; let a signal cut it
    // short.
    tokio::select! {
        result = agent.start() => result?,
        _ = shutdown.cancelled() => {
            agent.stop().await?;
            tracing::info!("tcpagg stopped before startup completed");
            return Ok(());
        }
    }

    let result = agent.run(shutdown).await;

    if let Err(e) = agent.stop().await {
        tracing::error!(error = %e, "error during shutdown");
    }

    result?;

    tracing::info!("tcpagg stopped");

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }

        shutdown.cancel();
    });
}
