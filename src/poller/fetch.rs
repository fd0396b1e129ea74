use serde_json::{json, Value};

use crate::config::ClientFlavor;
use crate::rpc::{hex, JsonRpc, RpcError};

/// `eth_syncing` progress while the node is catching up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    pub current: u64,
    pub highest: u64,
}

/// Pending transaction pool summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mempool {
    pub size: u64,
    /// Total raw transaction bytes, when the client exposes raw payloads.
    pub bytes: Option<u64>,
}

/// Decoded results of one tick's RPC calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub client_version: String,
    pub chain: Option<String>,
    pub block_hash: String,
    pub block_height: u64,
    /// `None` when the node reports it is not syncing.
    pub syncing: Option<SyncInfo>,
    pub gas_price_wei: u128,
    pub mempool: Option<Mempool>,
    pub peer_count: u64,
}

/// Issues every call for `flavor` concurrently.
///
/// Fails as soon as any call fails; nothing is returned for a partial tick.
pub async fn fetch<C: JsonRpc>(client: &C, flavor: ClientFlavor) -> Result<Snapshot, RpcError> {
    let (client_version, chain, (block_hash, block_height), syncing, gas_price_wei, mempool, peer_count) =
        tokio::try_join!(
            fetch_client_version(client),
            fetch_chain(client, flavor),
            fetch_latest_block(client),
            fetch_syncing(client),
            fetch_gas_price(client),
            fetch_mempool(client, flavor),
            fetch_peer_count(client, flavor),
        )?;

    Ok(Snapshot {
        client_version,
        chain,
        block_hash,
        block_height,
        syncing,
        gas_price_wei,
        mempool,
        peer_count,
    })
}

async fn fetch_client_version<C: JsonRpc>(client: &C) -> Result<String, RpcError> {
    const METHOD: &str = "web3_clientVersion";
    let result = client.call(METHOD, json!([])).await?;
    Ok(string(client, METHOD, &result, "result")?.to_string())
}

async fn fetch_chain<C: JsonRpc>(client: &C, flavor: ClientFlavor) -> Result<Option<String>, RpcError> {
    match flavor {
        ClientFlavor::Parity => {
            const METHOD: &str = "parity_chain";
            let result = client.call(METHOD, json!([])).await?;
            Ok(Some(string(client, METHOD, &result, "result")?.to_string()))
        }
        ClientFlavor::Geth => {
            const METHOD: &str = "eth_chainId";
            let result = client.call(METHOD, json!([])).await?;
            Ok(Some(quantity(client, METHOD, &result, "result")?.to_string()))
        }
        ClientFlavor::Generic => Ok(None),
    }
}

async fn fetch_latest_block<C: JsonRpc>(client: &C) -> Result<(String, u64), RpcError> {
    const METHOD: &str = "eth_getBlockByNumber";
    let result = client.call(METHOD, json!(["latest", false])).await?;
    if result.is_null() {
        return Err(RpcError::decode(client.url(), METHOD, "no latest block"));
    }

    let hash = string(client, METHOD, &result["hash"], "hash")?.to_string();
    let height = quantity(client, METHOD, &result["number"], "number")?;
    Ok((hash, height))
}

async fn fetch_syncing<C: JsonRpc>(client: &C) -> Result<Option<SyncInfo>, RpcError> {
    const METHOD: &str = "eth_syncing";
    let result = client.call(METHOD, json!([])).await?;
    match result {
        Value::Bool(false) | Value::Null => Ok(None),
        Value::Object(_) => Ok(Some(SyncInfo {
            current: quantity(client, METHOD, &result["currentBlock"], "currentBlock")?,
            highest: quantity(client, METHOD, &result["highestBlock"], "highestBlock")?,
        })),
        other => Err(RpcError::decode(
            client.url(),
            METHOD,
            format!("expected false, null or an object, got {other}"),
        )),
    }
}

async fn fetch_gas_price<C: JsonRpc>(client: &C) -> Result<u128, RpcError> {
    const METHOD: &str = "eth_gasPrice";
    let result = client.call(METHOD, json!([])).await?;
    let raw = string(client, METHOD, &result, "result")?;
    hex::parse_u128(raw).map_err(|e| RpcError::decode(client.url(), METHOD, e.to_string()))
}

async fn fetch_mempool<C: JsonRpc>(client: &C, flavor: ClientFlavor) -> Result<Option<Mempool>, RpcError> {
    match flavor {
        ClientFlavor::Parity => {
            const METHOD: &str = "parity_allTransactions";
            let result = client.call(METHOD, json!([])).await?;
            let txs = result.as_array().ok_or_else(|| {
                RpcError::decode(client.url(), METHOD, "expected an array of transactions")
            })?;

            let bytes = txs
                .iter()
                .map(|tx| tx["raw"].as_str().map_or(0, hex::data_len) as u64)
                .sum();

            Ok(Some(Mempool {
                size: txs.len() as u64,
                bytes: Some(bytes),
            }))
        }
        ClientFlavor::Geth => {
            const METHOD: &str = "txpool_status";
            let result = client.call(METHOD, json!([])).await?;
            let pending = quantity(client, METHOD, &result["pending"], "pending")?;
            let queued = quantity(client, METHOD, &result["queued"], "queued")?;

            Ok(Some(Mempool {
                size: pending.saturating_add(queued),
                bytes: None,
            }))
        }
        ClientFlavor::Generic => Ok(None),
    }
}

async fn fetch_peer_count<C: JsonRpc>(client: &C, flavor: ClientFlavor) -> Result<u64, RpcError> {
    match flavor {
        ClientFlavor::Parity => {
            const METHOD: &str = "parity_netPeers";
            let result = client.call(METHOD, json!([])).await?;
            let connected = &result["connected"];
            match connected.as_u64() {
                Some(n) => Ok(n),
                None => quantity(client, METHOD, connected, "connected"),
            }
        }
        ClientFlavor::Geth | ClientFlavor::Generic => {
            const METHOD: &str = "net_peerCount";
            let result = client.call(METHOD, json!([])).await?;
            quantity(client, METHOD, &result, "result")
        }
    }
}

fn string<'a, C: JsonRpc>(
    client: &C,
    method: &str,
    value: &'a Value,
    field: &str,
) -> Result<&'a str, RpcError> {
    value
        .as_str()
        .ok_or_else(|| RpcError::decode(client.url(), method, format!("{field} is not a string: {value}")))
}

fn quantity<C: JsonRpc>(client: &C, method: &str, value: &Value, field: &str) -> Result<u64, RpcError> {
    let raw = string(client, method, value, field)?;
    hex::parse_u64(raw).map_err(|e| RpcError::decode(client.url(), method, format!("{field}: {e}")))
}
