use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::rpc::{JsonRpc, RpcError};

/// In-memory JSON-RPC endpoint with scripted responses.
pub struct MockRpc {
    url: String,
    responses: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self {
            url: "http://mock:8545".to_string(),
            responses: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// A healthy generic node: version `v1.0`, block `0xaa` at height 1,
    /// 2 peers, not syncing.
    pub fn healthy() -> Self {
        Self::new()
            .with("web3_clientVersion", json!("v1.0"))
            .with("eth_getBlockByNumber", json!({"hash": "0xaa", "number": "0x1"}))
            .with("eth_syncing", json!(false))
            .with("eth_gasPrice", json!("0x4a817c800"))
            .with("net_peerCount", json!("0x2"))
    }

    pub fn with(self, method: &str, result: Value) -> Self {
        self.set(method, result);
        self
    }

    pub fn failing(self, method: &str) -> Self {
        self.fail(method);
        self
    }

    pub fn set(&self, method: &str, result: Value) {
        self.responses.lock().insert(method.to_string(), result);
    }

    pub fn fail(&self, method: &str) {
        self.failing.lock().insert(method.to_string());
    }

    pub fn heal(&self, method: &str) {
        self.failing.lock().remove(method);
    }

    /// Delays every answer by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.call_count(method) > 0
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == method).count()
    }
}

impl JsonRpc for MockRpc {
    fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        self.calls.lock().push(method.to_string());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().contains(method) {
            return Err(RpcError::Transport {
                url: self.url.clone(),
                method: method.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let response = self.responses.lock().get(method).cloned();
        response.ok_or_else(|| RpcError::Rpc {
            url: self.url.clone(),
            method: method.to_string(),
            code: -32601,
            message: "Method not found".to_string(),
        })
    }
}
