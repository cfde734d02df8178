//! Elasticsearch bulk-index sink
//!
//! Each batch becomes one `_bulk` request: an action line plus a document
//! line per log entry, indexed into `logstash-<namespace>-YYYY.MM.DD` by the
//! remapped timestamp.

use super::{ensure_success, join_url, Outbound, RecordSink};
use crate::dataset::{Labels, LogEntry};
use crate::error::{ReplayError, ReplayResult};
use crate::time_mapping::utc_datetime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Documents per `_bulk` request.
pub const LOG_BATCH_SIZE: usize = 1000;

const BACKEND: &str = "elasticsearch";

/// Field names owned by the document; tags never overwrite them.
const RESERVED_FIELDS: &[&str] = &[
    "@timestamp",
    "log_id",
    "cmdb_id",
    "log_level",
    "message",
    "namespace",
    "is_history",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogDocument {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub log_id: String,
    pub cmdb_id: String,
    pub log_level: String,
    pub message: String,
    pub namespace: String,
    pub is_history: bool,
    #[serde(flatten)]
    pub tags: Labels,
}

impl LogDocument {
    pub fn from_outbound(item: &Outbound<LogEntry>, namespace: &str) -> Self {
        let entry = &item.record;
        Self {
            timestamp: rfc3339_millis(item.timestamp),
            log_id: entry.log_id.clone(),
            cmdb_id: entry.cmdb_id.clone(),
            log_level: entry.level.clone(),
            message: entry.message.clone(),
            namespace: namespace.to_string(),
            is_history: item.is_history,
            tags: entry
                .tags
                .iter()
                .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn rfc3339_millis(ts: f64) -> String {
    utc_datetime(ts)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_default()
}

/// Date-suffixed index for a remapped timestamp.
pub fn index_name(namespace: &str, ts: f64) -> String {
    let day = utc_datetime(ts)
        .map(|dt| dt.format("%Y.%m.%d").to_string())
        .unwrap_or_else(|| "1970.01.01".to_string());
    format!("logstash-{}-{}", namespace, day)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ElasticsearchBulk {
    client: reqwest::Client,
    bulk_url: String,
    namespace: String,
}

impl ElasticsearchBulk {
    pub fn new(client: reqwest::Client, base_url: &str, namespace: &str) -> Self {
        Self {
            client,
            bulk_url: join_url(base_url, "_bulk"),
            namespace: namespace.to_string(),
        }
    }

    /// NDJSON body, newline-terminated as `_bulk` requires.
    pub fn build_body(&self, batch: &[Outbound<LogEntry>]) -> ReplayResult<String> {
        let mut body = String::with_capacity(batch.len() * 256);
        for item in batch {
            let action = serde_json::json!({
                "index": { "_index": index_name(&self.namespace, item.timestamp) }
            });
            let doc = LogDocument::from_outbound(item, &self.namespace);
            let doc = serde_json::to_string(&doc)
                .map_err(|e| ReplayError::backend(BACKEND, format!("encode document: {}", e)))?;
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl RecordSink<LogEntry> for ElasticsearchBulk {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn batch_size(&self) -> usize {
        LOG_BATCH_SIZE
    }

    async fn submit(&self, batch: Vec<Outbound<LogEntry>>) -> ReplayResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let body = self.build_body(&batch)?;
        let resp = self
            .client
            .post(&self.bulk_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| ReplayError::backend(BACKEND, e.to_string()))?;
        let resp = ensure_success(BACKEND, resp).await?;
        let parsed: BulkResponse = resp
            .json()
            .await
            .map_err(|e| ReplayError::backend(BACKEND, format!("unreadable bulk response: {}", e)))?;

        let accepted = parsed
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter(|r| (200..300).contains(&r.status))
            .count();
        if parsed.errors {
            let first_error = parsed
                .items
                .iter()
                .flat_map(|item| item.values())
                .find_map(|r| r.error.as_ref());
            warn!(
                submitted = batch.len(),
                accepted,
                error = ?first_error,
                "elasticsearch rejected part of a bulk request"
            );
        }
        Ok(accepted)
    }
}
