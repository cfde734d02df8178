//! Backend clients
//!
//! One sink per target store, all speaking the store's native bulk protocol:
//! - metrics: Prometheus remote write (protobuf + snappy)
//! - logs: Elasticsearch `_bulk` (NDJSON)
//! - traces: Jaeger collector `/api/traces` (JSON batches)
//!
//! Bulk loaders and replayers share these sinks; neither retries.

pub mod elasticsearch;
pub mod jaeger;
pub mod prometheus;
pub mod remote_write;

use crate::config::BackendConfig;
use crate::error::{ReplayError, ReplayResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A record on its way to a backend, with its remapped timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound<T> {
    pub record: T,
    /// Remapped epoch seconds.
    pub timestamp: f64,
    pub is_history: bool,
}

#[async_trait]
pub trait RecordSink<T: Send + 'static>: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Records per bulk submission (per metric name for metrics).
    fn batch_size(&self) -> usize;

    /// Submit one batch; `Ok` carries how many records the backend accepted.
    async fn submit(&self, batch: Vec<Outbound<T>>) -> ReplayResult<usize>;
}

#[async_trait]
impl<T, S> RecordSink<T> for Arc<S>
where
    T: Send + 'static,
    S: RecordSink<T> + ?Sized,
{
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }

    async fn submit(&self, batch: Vec<Outbound<T>>) -> ReplayResult<usize> {
        (**self).submit(batch).await
    }
}

/// Shared HTTP client for all backends.
pub fn http_client(config: &BackendConfig) -> ReplayResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ReplayError::config(format!("failed to build HTTP client: {}", e)))
}

/// Turn a non-2xx response into a submission error carrying the body.
pub(crate) async fn ensure_success(
    backend: &'static str,
    resp: reqwest::Response,
) -> ReplayResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ReplayError::backend(backend, format!("HTTP {}: {}", status, body)))
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://localhost:9090/", "/api/v1/write"), "http://localhost:9090/api/v1/write");
        assert_eq!(join_url("http://es:9200", "_bulk"), "http://es:9200/_bulk");
    }
}
