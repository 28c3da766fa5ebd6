use async_trait::async_trait;
use crate::error::Result;
use crate::types::{Endpoint, LogRow, Provider, ServerReport};
use serde_json::Value;

/// ServerDirectory: upstream listing of candidate measurement servers
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Raw server records. Each one is validated separately by the caller,
    /// so a single malformed entry never poisons the batch.
    async fn list_servers(&self) -> Result<Vec<Value>>;
}

/// SessionFactory: opens a measurement session pinned to one server
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Must select `endpoint` explicitly rather than letting the backend pick.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn MeasurementSession>>;
}

/// MeasurementSession: one attempt against one server
#[async_trait]
pub trait MeasurementSession: Send {
    /// Latency probe of the pinned server.
    async fn best_server(&mut self) -> Result<ServerReport>;

    /// Download throughput in bits per second.
    async fn download(&mut self, concurrency: usize) -> Result<f64>;

    /// Upload throughput in bits per second.
    async fn upload(&mut self, concurrency: usize) -> Result<f64>;
}

/// Recorder: durable local record of every cycle outcome
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, row: &LogRow) -> Result<()>;

    async fn record_failure(&self, ts_iso: &str, provider: Provider) -> Result<()>;
}

/// Forwarder: remote delivery of successful rows
#[async_trait]
pub trait Forwarder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn forward(&self, row: &LogRow) -> Result<()>;
}
