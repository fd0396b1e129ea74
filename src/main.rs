use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use rpcwatch::agent::Agent;
use rpcwatch::config::{ClientFlavor, Config, NodeTarget, ScheduleMode};

/// Default node when neither the config file nor the command line names one.
const DEFAULT_NODE: &str = "default=http://localhost:8545/";

/// Log level when neither the command line nor the config file sets one.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Prometheus exporter for Ethereum JSON-RPC nodes.
#[derive(Parser)]
#[command(name = "rpcwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "RPCWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, env = "RPCWATCH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Node to poll, as `name=url` or a bare url. Repeatable; replaces the
    /// nodes from the config file.
    #[arg(long = "node", env = "RPCWATCH_NODE", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Client implementation of nodes given with `--node`.
    #[arg(long, env = "RPCWATCH_CLIENT", value_enum, default_value_t = ClientFlavor::Generic)]
    client: ClientFlavor,

    /// Polling interval in milliseconds.
    #[arg(long, env = "RPCWATCH_INTERVAL")]
    interval: Option<u64>,

    /// Polling cadence across nodes.
    #[arg(long, env = "RPCWATCH_SCHEDULE", value_enum)]
    schedule: Option<ScheduleMode>,

    /// Listen address for `/metrics`, as `host:port` or `:port`.
    #[arg(long, env = "RPCWATCH_LISTEN")]
    listen: Option<String>,

    /// Also expose process metrics (CPU, memory, open fds).
    #[arg(long, env = "RPCWATCH_PROCESS_METRICS")]
    process_metrics: bool,

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
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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

impl Cli {
    /// Log level used until the config file has been read.
    fn startup_log_level(&self) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    /// Loads the config file, if any, and applies command-line overrides.
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }

        if !self.nodes.is_empty() {
            cfg.nodes = self
                .nodes
                .iter()
                .map(|raw| NodeTarget::parse_cli(raw, self.client))
                .collect::<Result<_>>()?;
        } else if cfg.nodes.is_empty() {
            cfg.nodes = vec![NodeTarget::parse_cli(DEFAULT_NODE, self.client)?];
        }

        if let Some(ms) = self.interval {
            cfg.interval = Duration::from_millis(ms);
        }

        if let Some(schedule) = self.schedule {
            cfg.schedule = schedule;
        }

        if let Some(listen) = self.listen {
            cfg.listen = listen;
        }

        if self.process_metrics {
            cfg.process_metrics = true;
        }

        cfg.validate().context("invalid configuration")?;

        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("rpcwatch {}", version::full());
        return Ok(());
    }

    // Initialize tracing before loading config so config errors are logged.
    // The config file's log level, if different, is applied afterwards.
    let initial_level = cli.startup_log_level();
    let filter = EnvFilter::try_new(&initial_level)
        .with_context(|| format!("invalid log level: {initial_level}"))?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_filter_reloading();
    let reload = subscriber.reload_handle();
    subscriber.init();

    let cfg = logged(cli.into_config(), "loading configuration")?;

    if cfg.log_level != initial_level {
        let filter = logged(
            EnvFilter::try_new(&cfg.log_level)
                .with_context(|| format!("invalid log level: {}", cfg.log_level)),
            "applying log level",
        )?;
        logged(
            reload.reload(filter).context("reloading log filter"),
            "applying log level",
        )?;
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        nodes = cfg.nodes.len(),
        "starting rpcwatch",
    );

    // Build and run the tokio runtime.
    let rt = logged(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("building tokio runtime"),
        "starting runtime",
    )?;

    logged(rt.block_on(run(cfg)), "rpcwatch failed")
}

/// Logs a failure through tracing before handing it back to `main`.
fn logged<T>(result: Result<T>, what: &str) -> Result<T> {
    if let Err(e) = &result {
        let message = format!("{e:#}");
        tracing::error!(error = %message, "{what}");
    }
    result
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("rpcwatch stopped");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "registering SIGTERM handler");
            }
        }
    }

    if let Err(e) = ctrl_c.await {
        tracing::error!(error = %e, "waiting for SIGINT");
        return;
    }
    tracing::info!("received SIGINT, shutting down");
}
