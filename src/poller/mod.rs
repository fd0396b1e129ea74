//! Per-node polling and reconciliation.
//!
//! A [`NodePoller`] owns the last published state of one node. Each tick
//! fetches a fresh [`fetch::Snapshot`], derives the state to publish, and
//! applies only the fields that changed to the shared [`GaugeStore`].
//! Identity-like facts (client version, chain, head hash) are encoded as
//! label values, so a change removes the old series before inserting the
//! new one and each node keeps at most one series per such metric.

pub mod fetch;
pub mod fixed;
pub mod gauges;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{NodeTarget, SyncProgressConfig};
use crate::rpc::JsonRpc;
use crate::store::{GaugeStore, MetricId, StoreError, StoreWriter};

pub use gauges::NodeGauges;
pub use state::{LatestBlock, NodeObservedState};

/// Result of one [`NodePoller::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The fetch succeeded and `changes` fields were republished.
    Updated { changes: usize },
    /// The fetch failed and the node was reset to neutral.
    Failed { changes: usize },
    /// The store rejected a mutation; published state may be partial.
    StoreFailed,
}

/// Polls one node and reconciles its gauges.
pub struct NodePoller<C> {
    target: NodeTarget,
    client: C,
    store: Arc<GaugeStore>,
    gauges: NodeGauges,
    progress: SyncProgressConfig,
    state: NodeObservedState,
    consecutive_failures: u64,
}

impl<C: JsonRpc> NodePoller<C> {
    pub fn new(
        target: NodeTarget,
        client: C,
        store: Arc<GaugeStore>,
        gauges: NodeGauges,
        progress: SyncProgressConfig,
    ) -> Self {
        Self {
            target,
            client,
            store,
            gauges,
            progress,
            state: NodeObservedState::default(),
            consecutive_failures: 0,
        }
    }

    /// Node name, the `node` label of every series this poller owns.
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Last published state.
    pub fn state(&self) -> &NodeObservedState {
        &self.state
    }

    /// Failed ticks since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    /// Runs one fetch and reconciliation.
    pub async fn tick(&mut self) -> TickOutcome {
        match fetch::fetch(&self.client, self.target.client).await {
            Ok(snapshot) => {
                if self.consecutive_failures > 0 {
                    info!(
                        node = %self.target.name,
                        failures = self.consecutive_failures,
                        "node recovered",
                    );
                }
                self.consecutive_failures = 0;

                let next = NodeObservedState::from_snapshot(snapshot, &self.progress);
                match self.reconcile(next) {
                    Ok(changes) => TickOutcome::Updated { changes },
                    Err(e) => self.store_failed(e),
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    warn!(
                        node = %self.target.name,
                        url = %self.target.url,
                        method = e.method(),
                        error = %e,
                        "poll failed, resetting node metrics",
                    );
                } else {
                    debug!(
                        node = %self.target.name,
                        method = e.method(),
                        failures = self.consecutive_failures,
                        error = %e,
                        "poll still failing",
                    );
                }

                let next = self.state.neutral();
                match self.reconcile(next) {
                    Ok(changes) => TickOutcome::Failed { changes },
                    Err(e) => self.store_failed(e),
                }
            }
        }
    }

    fn store_failed(&self, e: StoreError) -> TickOutcome {
        error!(node = %self.target.name, error = %e, "reconciling node metrics");
        TickOutcome::StoreFailed
    }

    /// Publishes every field of `next` that differs from the current state.
    ///
    /// All mutations happen under one store write, and each field of the
    /// observed state is updated only once its series has been written.
    fn reconcile(&mut self, next: NodeObservedState) -> Result<usize, StoreError> {
        let node = self.target.name.as_str();
        let g = self.gauges;
        let state = &mut self.state;
        let mut store = self.store.write();
        let mut changes = 0;

        if publish_label(
            &mut store,
            g.version,
            node,
            &mut state.client_version,
            next.client_version,
            String::as_str,
            |_| 1.0,
        )? {
            changes += 1;
            if let Some(version) = &state.client_version {
                info!(node, version = %version, "client version updated");
            }
        }

        if publish_label(
            &mut store,
            g.chain,
            node,
            &mut state.chain,
            next.chain,
            String::as_str,
            |_| 1.0,
        )? {
            changes += 1;
            if let Some(chain) = &state.chain {
                info!(node, chain = %chain, "chain updated");
            }
        }

        if publish_label(
            &mut store,
            g.latest,
            node,
            &mut state.latest_block,
            next.latest_block,
            |b| b.hash.as_str(),
            |b| b.height as f64,
        )? {
            changes += 1;
            if let Some(block) = &state.latest_block {
                info!(node, height = block.height, hash = %block.hash, "latest block updated");
            }
        }

        let sync = [
            (gauges::SYNC_CURRENT, &mut state.sync_current, next.sync_current),
            (gauges::SYNC_HIGHEST, &mut state.sync_highest, next.sync_highest),
        ];
        for (kind, current, next) in sync {
            if publish(&mut store, g.sync, &[node, kind], current, next, |v| *v as f64)? {
                changes += 1;
            }
        }

        if publish(
            &mut store,
            g.sync,
            &[node, gauges::SYNC_PROGRESS],
            &mut state.sync_progress,
            next.sync_progress,
            |p| p.to_f64(),
        )? {
            changes += 1;
            if let Some(progress) = &state.sync_progress {
                debug!(node, progress = %progress, "sync progress updated");
            }
        }

        if publish(
            &mut store,
            g.fee,
            &[node],
            &mut state.fee,
            next.fee,
            |f| f.to_f64(),
        )? {
            changes += 1;
            if let Some(fee) = &state.fee {
                info!(node, fee = %fee, "fee updated");
            }
        }
        state.gas_price_wei = next.gas_price_wei;

        let mempool = [
            (gauges::MEMPOOL_SIZE, &mut state.mempool_size, next.mempool_size),
            (gauges::MEMPOOL_BYTES, &mut state.mempool_bytes, next.mempool_bytes),
        ];
        for (kind, current, next) in mempool {
            if publish(&mut store, g.mempool, &[node, kind], current, next, |v| *v as f64)? {
                changes += 1;
            }
        }

        if publish(
            &mut store,
            g.peers,
            &[node],
            &mut state.peer_count,
            next.peer_count,
            |v| *v as f64,
        )? {
            changes += 1;
            debug!(node, peers = ?state.peer_count, "peer count updated");
        }

        if publish(
            &mut store,
            g.up,
            &[node],
            &mut state.up,
            next.up,
            |up| if *up { 1.0 } else { 0.0 },
        )? {
            changes += 1;
        }

        if changes > 0 {
            debug!(node, changes, "reconciled node metrics");
        }

        Ok(changes)
    }
}

/// Publishes a plain numeric field whose labels never change.
///
/// Returns whether the store was touched.
fn publish<T: PartialEq>(
    store: &mut StoreWriter<'_>,
    id: MetricId,
    labels: &[&str],
    current: &mut Option<T>,
    next: Option<T>,
    value: impl Fn(&T) -> f64,
) -> Result<bool, StoreError> {
    if *current == next {
        return Ok(false);
    }

    match &next {
        Some(v) => store.set_labeled(id, labels, value(v))?,
        None => {
            store.remove_labeled(id, labels)?;
        }
    }

    *current = next;
    Ok(true)
}

/// Publishes a value-as-label field: the old `{node, label}` series is
/// removed before the new one is set.
///
/// Returns whether the store was touched.
fn publish_label<T: PartialEq>(
    store: &mut StoreWriter<'_>,
    id: MetricId,
    node: &str,
    current: &mut Option<T>,
    next: Option<T>,
    label: impl Fn(&T) -> &str,
    value: impl Fn(&T) -> f64,
) -> Result<bool, StoreError> {
    if *current == next {
        return Ok(false);
    }

    if let Some(old) = current.as_ref() {
        let old_label = label(old);
        if next.as_ref().map(&label) != Some(old_label) {
            store.remove_labeled(id, &[node, old_label])?;
            *current = None;
        }
    }

    if let Some(new) = next.as_ref() {
        store.set_labeled(id, &[node, label(new)], value(new))?;
    }

    *current = next;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::testing::MockRpc;
    use super::*;
    use crate::config::ClientFlavor;
    use crate::store::Series;

    fn target(name: &str, client: ClientFlavor) -> NodeTarget {
        NodeTarget {
            name: name.to_string(),
            url: format!("http://{name}:8545"),
            client,
            timeout: Duration::from_secs(1),
        }
    }

    fn setup() -> (Arc<GaugeStore>, NodeGauges) {
        let store = Arc::new(GaugeStore::default());
        let gauges = NodeGauges::register(&store).expect("register gauges");
        (store, gauges)
    }

    fn poller(
        name: &str,
        rpc: Arc<MockRpc>,
        store: &Arc<GaugeStore>,
        gauges: NodeGauges,
    ) -> NodePoller<Arc<MockRpc>> {
        NodePoller::new(
            target(name, ClientFlavor::Generic),
            rpc,
            Arc::clone(store),
            gauges,
            SyncProgressConfig::default(),
        )
    }

    fn series(store: &GaugeStore, id: MetricId, node: &str) -> Vec<Series> {
        store.series_for(id, node).expect("series")
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_block_change_replaces_series() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", Arc::clone(&rpc), &store, g);

        assert!(matches!(a.tick().await, TickOutcome::Updated { .. }));

        let version = series(&store, g.version, "a");
        assert_eq!(version.len(), 1);
        assert_eq!(version[0].labels, labels(&["a", "v1.0"]));
        assert_eq!(version[0].value, 1.0);

        let latest = series(&store, g.latest, "a");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].labels, labels(&["a", "0xaa"]));
        assert_eq!(latest[0].value, 1.0);

        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(2.0));

        rpc.set("eth_getBlockByNumber", json!({"hash": "0xbb", "number": "0x2"}));
        let outcome = a.tick().await;

        let latest = series(&store, g.latest, "a");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].labels, labels(&["a", "0xbb"]));
        assert_eq!(latest[0].value, 2.0);

        // Only the head and the derived sync current/highest changed.
        assert_eq!(outcome, TickOutcome::Updated { changes: 3 });
        assert_eq!(series(&store, g.version, "a").len(), 1);
        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(2.0));
    }

    #[tokio::test]
    async fn test_unchanged_tick_does_not_mutate_store() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", rpc, &store, g);

        a.tick().await;
        let generation = store.generation();
        let rendered = store.render_snapshot().expect("render");

        assert_eq!(a.tick().await, TickOutcome::Updated { changes: 0 });
        assert_eq!(store.generation(), generation);
        assert_eq!(store.render_snapshot().expect("render"), rendered);
    }

    #[tokio::test]
    async fn test_value_as_label_series_stay_unique() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", Arc::clone(&rpc), &store, g);

        for (i, version) in ["v1.0", "v1.1", "v1.1", "v2.0", "v1.0"].iter().enumerate() {
            rpc.set("web3_clientVersion", json!(version));
            rpc.set(
                "eth_getBlockByNumber",
                json!({"hash": format!("0x{:02x}", i % 3), "number": format!("0x{:x}", i + 1)}),
            );
            a.tick().await;

            let version_series = series(&store, g.version, "a");
            assert_eq!(version_series.len(), 1);
            assert_eq!(version_series[0].labels[1], *version);
            assert_eq!(series(&store, g.latest, "a").len(), 1);
        }
    }

    #[tokio::test]
    async fn test_same_hash_new_height_updates_value() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", Arc::clone(&rpc), &store, g);
        a.tick().await;

        rpc.set("eth_getBlockByNumber", json!({"hash": "0xaa", "number": "0x7"}));
        a.tick().await;

        let latest = series(&store, g.latest, "a");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 7.0);
    }

    #[tokio::test]
    async fn test_failure_resets_node_to_neutral() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", Arc::clone(&rpc), &store, g);
        a.tick().await;
        assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(1.0));

        rpc.fail("net_peerCount");
        assert!(matches!(a.tick().await, TickOutcome::Failed { .. }));

        assert!(series(&store, g.version, "a").is_empty());
        assert!(series(&store, g.latest, "a").is_empty());
        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(0.0));
        assert_eq!(store.value(g.fee, &["a"]).expect("value"), Some(0.0));
        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_PROGRESS]).expect("value"),
            Some(0.0)
        );
        assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(0.0));
        assert_eq!(a.state().client_version, None);
        assert_eq!(a.consecutive_failures(), 1);

        // A second failure has nothing left to reset.
        let generation = store.generation();
        assert_eq!(a.tick().await, TickOutcome::Failed { changes: 0 });
        assert_eq!(store.generation(), generation);
        assert_eq!(a.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_applies_nothing() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy());
        let mut a = poller("a", Arc::clone(&rpc), &store, g);
        a.tick().await;

        // Version and block would change, but gas price fails.
        rpc.set("web3_clientVersion", json!("v2.0"));
        rpc.set("eth_getBlockByNumber", json!({"hash": "0xbb", "number": "0x2"}));
        rpc.fail("eth_gasPrice");
        a.tick().await;

        assert!(series(&store, g.version, "a").is_empty());
        assert!(series(&store, g.latest, "a").is_empty());
        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(0.0));
        assert_eq!(a.state().latest_block, None);
    }

    #[tokio::test]
    async fn test_recovery_republishes_everything() {
        let (store, g) = setup();
        let rpc = Arc::new(MockRpc::healthy().failing("web3_clientVersion"));
        let mut a = poller("a", Arc::clone(&rpc), &store, g);

        a.tick().await;
        // Nothing was ever published, so only `up` exists.
        assert!(series(&store, g.peers, "a").is_empty());
        assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(0.0));

        rpc.heal("web3_clientVersion");
        assert!(matches!(a.tick().await, TickOutcome::Updated { .. }));
        assert_eq!(series(&store, g.version, "a").len(), 1);
        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(2.0));
        assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(1.0));
        assert_eq!(a.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failing_node_does_not_affect_healthy_node() {
        let (store, g) = setup();
        let healthy = Arc::new(MockRpc::healthy());
        let broken = Arc::new(MockRpc::healthy().failing("eth_getBlockByNumber"));
        let mut a = poller("a", Arc::clone(&healthy), &store, g);
        let mut b = poller("b", broken, &store, g);

        for i in 1..=4u64 {
            healthy.set(
                "eth_getBlockByNumber",
                json!({"hash": format!("0x{i:02x}"), "number": format!("0x{i:x}")}),
            );
            let (ra, rb) = tokio::join!(a.tick(), b.tick());
            assert!(matches!(ra, TickOutcome::Updated { .. }));
            assert!(matches!(rb, TickOutcome::Failed { .. }));

            let latest = series(&store, g.latest, "a");
            assert_eq!(latest.len(), 1);
            assert_eq!(latest[0].value, i as f64);
            assert!(series(&store, g.latest, "b").is_empty());
            assert!(series(&store, g.version, "b").is_empty());
            assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(1.0));
            assert_eq!(store.value(g.up, &["b"]).expect("value"), Some(0.0));
        }
    }

    #[tokio::test]
    async fn test_null_syncing_is_fully_synced() {
        let (store, g) = setup();
        let rpc = MockRpc::healthy().with("eth_syncing", Value::Null);
        let mut a = poller("a", Arc::new(rpc), &store, g);

        assert!(matches!(a.tick().await, TickOutcome::Updated { .. }));
        assert_eq!(store.value(g.up, &["a"]).expect("value"), Some(1.0));
        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_CURRENT]).expect("value"),
            Some(1.0)
        );
        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_PROGRESS]).expect("value"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_parity_mempool_and_chain() {
        let (store, g) = setup();
        let rpc = MockRpc::healthy()
            .with("parity_chain", json!("foundation"))
            .with("parity_allTransactions", json!([{"raw": "0x0102"}]))
            .with("parity_netPeers", json!({"connected": 7}));
        let mut a = NodePoller::new(
            target("a", ClientFlavor::Parity),
            rpc,
            Arc::clone(&store),
            g,
            SyncProgressConfig::default(),
        );
        a.tick().await;

        let chain = series(&store, g.chain, "a");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].labels, labels(&["a", "foundation"]));
        assert_eq!(
            store.value(g.mempool, &["a", gauges::MEMPOOL_SIZE]).expect("value"),
            Some(1.0)
        );
        assert_eq!(
            store.value(g.mempool, &["a", gauges::MEMPOOL_BYTES]).expect("value"),
            Some(2.0)
        );
        assert_eq!(store.value(g.peers, &["a"]).expect("value"), Some(7.0));
    }

    #[tokio::test]
    async fn test_sync_and_fee_values() {
        let (store, g) = setup();
        let rpc = MockRpc::healthy().with(
            "eth_syncing",
            json!({"currentBlock": "0x1", "highestBlock": "0x4"}),
        );
        let mut a = poller("a", Arc::new(rpc), &store, g);
        a.tick().await;

        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_CURRENT]).expect("value"),
            Some(1.0)
        );
        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_HIGHEST]).expect("value"),
            Some(4.0)
        );
        assert_eq!(
            store.value(g.sync, &["a", gauges::SYNC_PROGRESS]).expect("value"),
            Some(0.25)
        );
        assert_eq!(store.value(g.fee, &["a"]).expect("value"), Some(0.00042));
    }
}
