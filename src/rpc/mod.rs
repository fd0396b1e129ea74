pub mod hex;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Request id sent with every call. Responses are matched by connection,
/// not by id, since each HTTP request carries exactly one call.
pub const REQUEST_ID: u64 = 42;

/// Default per-request timeout when a node does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a single JSON-RPC call.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The node could not be reached or answered with something that is
    /// not a JSON-RPC envelope.
    #[error("transport error calling {method} on {url}: {message}")]
    Transport {
        url: String,
        method: String,
        message: String,
    },

    /// The node answered with a JSON-RPC `error` object.
    #[error("RPC error for {url} calling {method} (code: {code}): {message}")]
    Rpc {
        url: String,
        method: String,
        code: i64,
        message: String,
    },

    /// The call succeeded but its result had an unexpected shape.
    #[error("decoding {method} result from {url}: {message}")]
    Decode {
        url: String,
        method: String,
        message: String,
    },
}

impl RpcError {
    /// Builds a [`RpcError::Decode`] for a result returned by `method`.
    pub fn decode(url: &str, method: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            url: url.to_string(),
            method: method.to_string(),
            message: message.into(),
        }
    }

    /// The JSON-RPC method that failed.
    pub fn method(&self) -> &str {
        match self {
            Self::Transport { method, .. } | Self::Rpc { method, .. } | Self::Decode { method, .. } => {
                method
            }
        }
    }
}

/// A JSON-RPC endpoint.
pub trait JsonRpc: Send + Sync {
    /// Endpoint URL, used in diagnostics.
    fn url(&self) -> &str;

    /// Issues one call and returns its `result` verbatim.
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

impl<T: JsonRpc> JsonRpc for std::sync::Arc<T> {
    fn url(&self) -> &str {
        (**self).url()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        (**self).call(method, params).await
    }
}

/// HTTP JSON-RPC 2.0 client for a single node.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    url: String,
}

impl HttpClient {
    /// Creates a client for `url`. A zero timeout falls back to
    /// [`DEFAULT_TIMEOUT`].
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    fn transport(&self, method: &str, message: impl Into<String>) -> RpcError {
        RpcError::Transport {
            url: self.url.clone(),
            method: method.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

impl JsonRpc for HttpClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        trace!(url = %self.url, method, "rpc call");

        let body = Request {
            jsonrpc: "2.0",
            method,
            params: &params,
            id: REQUEST_ID,
        };

        let response = self
            .http
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(method, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport(method, format!("unexpected HTTP status {status}")));
        }

        let envelope: Response = response
            .json()
            .await
            .map_err(|e| self.transport(method, format!("invalid response body: {e}")))?;

        into_result(&self.url, method, envelope)
    }
}

fn into_result(url: &str, method: &str, envelope: Response) -> Result<Value, RpcError> {
    match envelope.error {
        Some(error) => Err(RpcError::Rpc {
            url: url.to_string(),
            method: method.to_string(),
            code: error.code,
            message: error.message,
        }),
        None => Ok(envelope.result),
    }
}
