use crate::store::{GaugeStore, MetricId, StoreError};

/// `type` label values of the sync gauge.
pub const SYNC_CURRENT: &str = "current";
pub const SYNC_HIGHEST: &str = "highest";
pub const SYNC_PROGRESS: &str = "progress";

/// `type` label values of the mempool gauge.
pub const MEMPOOL_SIZE: &str = "size";
pub const MEMPOOL_BYTES: &str = "bytes";

/// Gauges published for every node. Every one carries `node` as its first
/// label.
#[derive(Debug, Clone, Copy)]
pub struct NodeGauges {
    /// `{node, value}` = 1, value-as-label.
    pub version: MetricId,
    /// `{node, value}` = 1, value-as-label.
    pub chain: MetricId,
    /// `{node, hash}` = block height, value-as-label.
    pub latest: MetricId,
    /// `{node, type}` with type current/highest/progress.
    pub sync: MetricId,
    /// `{node, type}` with type size/bytes.
    pub mempool: MetricId,
    /// `{node}` = ETH per standard transfer.
    pub fee: MetricId,
    /// `{node}` = connected peers.
    pub peers: MetricId,
    /// `{node}` = 1 when the last tick succeeded.
    pub up: MetricId,
}

impl NodeGauges {
    /// Registers every node gauge. Call once per store.
    pub fn register(store: &GaugeStore) -> Result<Self, StoreError> {
        Ok(Self {
            version: store.register("client_version", "Client version", &["node", "value"])?,
            chain: store.register("client_chain", "Client chain", &["node", "value"])?,
            latest: store.register(
                "client_blockchain_latest",
                "Latest block information",
                &["node", "hash"],
            )?,
            sync: store.register("client_blockchain_sync", "Blockchain sync info", &["node", "type"])?,
            mempool: store.register("client_mempool_size", "Mempool information", &["node", "type"])?,
            fee: store.register(
                "client_fee",
                "Approximate fee per 21000 gas by eth_gasPrice method",
                &["node"],
            )?,
            peers: store.register("client_peers", "Connected peers", &["node"])?,
            up: store.register("client_up", "Whether the last poll of the node succeeded", &["node"])?,
        })
    }
}
