use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::MetricsServer;
use crate::poller::{NodeGauges, NodePoller};
use crate::rpc::HttpClient;
use crate::scheduler::Scheduler;
use crate::store::GaugeStore;

/// Agent wires the store, the metrics server and the polling loop.
pub struct Agent {
    cfg: Config,
    store: Arc<GaugeStore>,
    gauges: NodeGauges,
    server: MetricsServer,
    scheduler: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, registering every gauge.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("validating config")?;

        let store = Arc::new(GaugeStore::new(&cfg.namespace));
        let gauges = NodeGauges::register(&store).context("registering node gauges")?;
        if cfg.process_metrics {
            store.register_process_metrics();
        }

        let server = MetricsServer::new(Arc::clone(&store), &cfg.bind_addr());

        Ok(Self {
            cfg,
            store,
            gauges,
            server,
            scheduler: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Shared gauge store.
    pub fn store(&self) -> &Arc<GaugeStore> {
        &self.store
    }

    /// Gauge handles registered for every node.
    pub fn gauges(&self) -> NodeGauges {
        self.gauges
    }

    /// Starts the metrics server, then the polling loop.
    ///
    /// Returns the address the metrics server is bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = self
            .server
            .start()
            .await
            .context("starting metrics server")?;

        let mut pollers = Vec::with_capacity(self.cfg.nodes.len());
        for target in &self.cfg.nodes {
            let client = HttpClient::new(&target.url, target.timeout)
                .with_context(|| format!("creating client for node {}", target.name))?;

            info!(
                node = %target.name,
                url = %target.url,
                client = target.client.as_str(),
                "polling node",
            );

            pollers.push(NodePoller::new(
                target.clone(),
                client,
                Arc::clone(&self.store),
                self.gauges,
                self.cfg.sync_progress,
            ));
        }

        let scheduler = Scheduler::new(
            pollers,
            self.cfg.schedule,
            self.cfg.interval,
            self.cfg.min_delay,
        );
        self.scheduler = Some(scheduler.spawn(self.cancel.child_token()));

        info!(addr = %addr, "agent fully started");

        Ok(addr)
    }

    /// Stops polling, waits for the loop to exit, then stops the server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.scheduler.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler task failed");
            }
        }

        self.server.stop();

        info!("agent stopped");

        Ok(())
    }
}
