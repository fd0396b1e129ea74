use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::store::GaugeStore;

/// HTTP server exposing the gauge store on `/metrics`.
pub struct MetricsServer {
    store: Arc<GaugeStore>,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl MetricsServer {
    /// Creates a server for the socket address `addr`. Nothing is bound
    /// until [`MetricsServer::start`].
    pub fn new(store: Arc<GaugeStore>, addr: &str) -> Self {
        Self {
            store,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background.
    ///
    /// Returns the bound address. Failing to bind is fatal to the caller.
    pub async fn start(&self) -> Result<SocketAddr> {
        let app = router(Arc::clone(&self.store));

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting connections. In-flight scrapes complete.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Routes for the exposition endpoint.
pub fn router(store: Arc<GaugeStore>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(store)
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(store): State<Arc<GaugeStore>>) -> Response {
    match store.render_snapshot() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, store.content_type())],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_peers() -> Arc<GaugeStore> {
        let store = Arc::new(GaugeStore::default());
        let id = store
            .register("client_peers", "Connected peers", &["node"])
            .expect("register");
        store.set_labeled(id, &["a"], 25.0).expect("set");
        store
    }

    #[tokio::test]
    async fn test_serves_metrics_and_healthz() {
        let store = store_with_peers();
        let server = MetricsServer::new(store, "127.0.0.1:0");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("scrape");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("content type");
        assert!(content_type.starts_with("text/plain"));
        let body = response.text().await.expect("body");
        assert!(body.contains("client_peers{node=\"a\"} 25"));

        let health = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(health, "ok");

        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let server = MetricsServer::new(store_with_peers(), "127.0.0.1:0");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(format!("http://{addr}/other"))
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        server.stop();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = MetricsServer::new(store_with_peers(), "127.0.0.1:0");
        let addr = first.start().await.expect("start");

        let second = MetricsServer::new(store_with_peers(), &addr.to_string());
        let err = second.start().await.expect_err("address in use");
        assert!(err.to_string().contains("listening on"));

        first.stop();
    }
}
