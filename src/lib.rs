//! Polls Ethereum JSON-RPC nodes and exposes their state as Prometheus
//! gauges.

pub mod agent;
pub mod config;
pub mod export;
pub mod poller;
pub mod rpc;
pub mod scheduler;
pub mod store;
