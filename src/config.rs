use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Nodes to poll.
    #[serde(default)]
    pub nodes: Vec<NodeTarget>,

    /// Target start-to-start spacing between ticks. Default: 100ms.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Lower bound on the wait between ticks. Default: 10ms.
    #[serde(default = "default_min_delay", with = "humantime_serde")]
    pub min_delay: Duration,

    /// Whether nodes share one polling cadence or run independently.
    #[serde(default)]
    pub schedule: ScheduleMode,

    /// Listen address for `/metrics`, as `host:port` or `:port`.
    /// Default: "localhost:8000".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Also expose process-level metrics (CPU, memory, fds).
    #[serde(default)]
    pub process_metrics: bool,

    /// Optional prefix prepended to every metric name.
    #[serde(default)]
    pub namespace: String,

    /// Representation of the sync progress gauge.
    #[serde(default)]
    pub sync_progress: SyncProgressConfig,
}

/// A node to poll. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeTarget {
    /// Unique name, used as the `node` label on every series.
    pub name: String,

    /// JSON-RPC endpoint URL.
    pub url: String,

    /// Client implementation; selects the chain, mempool and peer methods.
    #[serde(default)]
    pub client: ClientFlavor,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_node_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Node client implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClientFlavor {
    /// Parity / OpenEthereum: `parity_chain`, `parity_allTransactions`,
    /// `parity_netPeers`.
    Parity,
    /// Geth and compatible: `eth_chainId`, `txpool_status`, `net_peerCount`.
    Geth,
    /// Standard methods only: `net_peerCount`, no chain or mempool.
    #[default]
    Generic,
}

impl ClientFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parity => "parity",
            Self::Geth => "geth",
            Self::Generic => "generic",
        }
    }
}

/// Polling cadence across nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// One loop; every tick polls all nodes concurrently.
    #[default]
    Shared,
    /// One independent loop per node.
    PerNode,
}

/// Scale of the sync progress gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressScale {
    /// 0 to 1.
    #[default]
    Fraction,
    /// 0 to 100.
    Percent,
}

impl ProgressScale {
    /// Value of a fully synced node.
    pub fn full(&self) -> u64 {
        match self {
            Self::Fraction => 1,
            Self::Percent => 100,
        }
    }
}

/// Sync progress gauge format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncProgressConfig {
    #[serde(default)]
    pub scale: ProgressScale,

    /// Decimal digits kept after rounding. Default: 5.
    #[serde(default = "default_progress_precision")]
    pub precision: u32,
}

/// Largest supported progress precision.
pub const MAX_PROGRESS_PRECISION: u32 = 9;

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_min_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_listen() -> String {
    "localhost:8000".to_string()
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_progress_precision() -> u32 {
    5
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            nodes: Vec::new(),
            interval: default_interval(),
            min_delay: default_min_delay(),
            schedule: ScheduleMode::default(),
            listen: default_listen(),
            process_metrics: false,
            namespace: String::new(),
            sync_progress: SyncProgressConfig::default(),
        }
    }
}

impl Default for SyncProgressConfig {
    fn default() -> Self {
        Self {
            scale: ProgressScale::default(),
            precision: default_progress_precision(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The result is not validated; apply command-line overrides first, then
    /// call [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("at least one node is required");
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                bail!("node name must not be empty (url {})", node.url);
            }

            if !names.insert(node.name.as_str()) {
                bail!("duplicate node name: {}", node.name);
            }

            let url = reqwest::Url::parse(&node.url)
                .with_context(|| format!("invalid url for node {}: {:?}", node.name, node.url))?;
            match url.scheme() {
                "http" | "https" => {}
                scheme => bail!("node {} url must be http or https, got {scheme}", node.name),
            }
        }

        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.min_delay.is_zero() {
            bail!("min_delay must be positive");
        }

        if self.listen.is_empty() {
            bail!("listen address is required");
        }

        if self.sync_progress.precision > MAX_PROGRESS_PRECISION {
            bail!(
                "sync_progress.precision must be at most {MAX_PROGRESS_PRECISION}, got {}",
                self.sync_progress.precision
            );
        }

        Ok(())
    }

    /// Socket address string for the listener, expanding `:port` to all
    /// interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

impl NodeTarget {
    /// Parses a `--node` argument: `name=url` or a bare url.
    ///
    /// A bare url is named after its `host:port`.
    pub fn parse_cli(raw: &str, client: ClientFlavor) -> Result<Self> {
        let (name, url) = match raw.split_once('=') {
            Some((name, url)) if !name.contains("://") => (name.to_string(), url.to_string()),
            _ => {
                let parsed = reqwest::Url::parse(raw)
                    .with_context(|| format!("invalid node url {raw:?}"))?;
                let host = parsed
                    .host_str()
                    .with_context(|| format!("node url {raw:?} has no host"))?;
                let name = match parsed.port_or_known_default() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                (name, raw.to_string())
            }
        };

        Ok(Self {
            name,
            url,
            client,
            timeout: default_node_timeout(),
        })
    }
}
