use crate::config::SyncProgressConfig;

use super::fetch::Snapshot;
use super::fixed::{self, Fixed};

/// Head of the chain as last published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestBlock {
    pub hash: String,
    pub height: u64,
}

/// Last values published for one node.
///
/// `None` means the field has never been published, or its series was
/// removed. A published zero is `Some(0)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeObservedState {
    pub up: Option<bool>,
    pub client_version: Option<String>,
    pub chain: Option<String>,
    pub latest_block: Option<LatestBlock>,
    pub sync_current: Option<u64>,
    pub sync_highest: Option<u64>,
    pub sync_progress: Option<Fixed>,
    pub gas_price_wei: Option<u128>,
    pub fee: Option<Fixed>,
    pub mempool_size: Option<u64>,
    pub mempool_bytes: Option<u64>,
    pub peer_count: Option<u64>,
}

impl NodeObservedState {
    /// The state to publish for a successful fetch.
    pub fn from_snapshot(snapshot: Snapshot, progress: &SyncProgressConfig) -> Self {
        let height = snapshot.block_height;
        let (current, highest) = match snapshot.syncing {
            Some(sync) => (sync.current, sync.highest),
            None => (height, height),
        };

        let (mempool_size, mempool_bytes) = match snapshot.mempool {
            Some(mempool) => (Some(mempool.size), mempool.bytes),
            None => (None, None),
        };

        Self {
            up: Some(true),
            client_version: Some(snapshot.client_version),
            chain: snapshot.chain,
            latest_block: Some(LatestBlock {
                hash: snapshot.block_hash,
                height,
            }),
            sync_current: Some(current),
            sync_highest: Some(highest),
            sync_progress: Some(fixed::sync_progress(
                current,
                highest,
                progress.scale.full(),
                progress.precision,
            )),
            gas_price_wei: Some(snapshot.gas_price_wei),
            fee: Some(fixed::transfer_fee(snapshot.gas_price_wei)),
            mempool_size,
            mempool_bytes,
            peer_count: Some(snapshot.peer_count),
        }
    }

    /// The state to publish after a failed fetch.
    ///
    /// Value-as-label series are cleared, numeric series that were
    /// published drop to zero, and `up` drops to zero.
    pub fn neutral(&self) -> Self {
        fn zero<T: Default>(v: &Option<T>) -> Option<T> {
            v.as_ref().map(|_| T::default())
        }

        Self {
            up: Some(false),
            client_version: None,
            chain: None,
            latest_block: None,
            sync_current: zero(&self.sync_current),
            sync_highest: zero(&self.sync_highest),
            sync_progress: self.sync_progress.map(|p| Fixed::zero(p.decimals())),
            gas_price_wei: zero(&self.gas_price_wei),
            fee: self.fee.map(|f| Fixed::zero(f.decimals())),
            mempool_size: zero(&self.mempool_size),
            mempool_bytes: zero(&self.mempool_bytes),
            peer_count: zero(&self.peer_count),
        }
    }
}
