//! Jaeger collector sink
//!
//! Spans are grouped by service into processed batches and posted as JSON to
//! the collector's `/api/traces` endpoint. Dataset ids are arbitrary strings,
//! so trace and span ids are hashed to stable 64-bit values; a parent id maps
//! to the same value as the span it names, which keeps references intact.

use super::{ensure_success, join_url, Outbound, RecordSink};
use crate::dataset::TraceSpan;
use crate::error::{ReplayError, ReplayResult};
use crate::time_mapping::MICROS_PER_SEC;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

/// Spans per collector submission.
pub const TRACE_BATCH_SIZE: usize = 1000;

const BACKEND: &str = "jaeger";

/// First 8 bytes of the SHA-256 digest, big-endian. Zero is not a valid
/// Jaeger id and becomes 1.
pub fn stable_id(raw: &str) -> u64 {
    let digest = Sha256::digest(raw.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(head) {
        0 => 1,
        id => id,
    }
}

fn hex_id(raw: &str) -> String {
    format!("{:016x}", stable_id(raw))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JaegerTag {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: serde_json::Value,
}

impl JaegerTag {
    fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: "string",
            value: serde_json::Value::String(value.into()),
        }
    }

    fn boolean(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            kind: "bool",
            value: serde_json::Value::Bool(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JaegerReference {
    #[serde(rename = "refType")]
    pub ref_type: &'static str,
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JaegerSpan {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    #[serde(rename = "operationName")]
    pub operation_name: String,
    pub references: Vec<JaegerReference>,
    pub flags: u32,
    /// Microseconds since epoch.
    #[serde(rename = "startTime")]
    pub start_time: i64,
    /// Microseconds.
    pub duration: i64,
    pub tags: Vec<JaegerTag>,
}

impl JaegerSpan {
    pub fn from_outbound(item: &Outbound<TraceSpan>) -> Self {
        let span = &item.record;
        let trace_id = hex_id(&span.trace_id);
        let references = span
            .parent_span_id
            .as_deref()
            .filter(|p| !p.is_empty() && *p != span.span_id)
            .map(|parent| JaegerReference {
                ref_type: "CHILD_OF",
                trace_id: trace_id.clone(),
                span_id: hex_id(parent),
            })
            .into_iter()
            .collect();

        let mut tags: Vec<JaegerTag> = Vec::with_capacity(span.tags.len() + 2);
        for (key, value) in &span.tags {
            if key == "has_error" {
                tags.push(JaegerTag::boolean("error", value == "true"));
            } else {
                tags.push(JaegerTag::string(key.as_str(), value.as_str()));
            }
        }
        tags.push(JaegerTag::boolean("is_history", item.is_history));
        tags.push(JaegerTag::string("source.span_id", span.span_id.as_str()));

        Self {
            trace_id,
            span_id: hex_id(&span.span_id),
            operation_name: span.operation_name.clone(),
            references,
            flags: 1,
            start_time: (item.timestamp * MICROS_PER_SEC).round() as i64,
            duration: (span.duration_ms * 1000.0).round().max(0.0) as i64,
            tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JaegerProcess {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub tags: Vec<JaegerTag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JaegerBatch {
    pub process: JaegerProcess,
    pub spans: Vec<JaegerSpan>,
}

#[derive(Debug)]
pub struct JaegerCollector {
    client: reqwest::Client,
    traces_url: String,
    namespace: String,
}

impl JaegerCollector {
    pub fn new(client: reqwest::Client, collector_url: &str, namespace: &str) -> Self {
        Self {
            client,
            traces_url: join_url(collector_url, "api/traces"),
            namespace: namespace.to_string(),
        }
    }

    /// One batch per service, services in name order.
    pub fn build_batches(&self, batch: &[Outbound<TraceSpan>]) -> Vec<JaegerBatch> {
        let mut by_service: BTreeMap<&str, Vec<JaegerSpan>> = BTreeMap::new();
        for item in batch {
            by_service
                .entry(item.record.service.as_str())
                .or_default()
                .push(JaegerSpan::from_outbound(item));
        }
        by_service
            .into_iter()
            .map(|(service, spans)| JaegerBatch {
                process: JaegerProcess {
                    service_name: service.to_string(),
                    tags: vec![JaegerTag::string("namespace", self.namespace.as_str())],
                },
                spans,
            })
            .collect()
    }

    async fn post(&self, batch: &JaegerBatch) -> ReplayResult<()> {
        let resp = self
            .client
            .post(&self.traces_url)
            .json(batch)
            .send()
            .await
            .map_err(|e| ReplayError::backend(BACKEND, e.to_string()))?;
        ensure_success(BACKEND, resp).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink<TraceSpan> for JaegerCollector {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn batch_size(&self) -> usize {
        TRACE_BATCH_SIZE
    }

    async fn submit(&self, batch: Vec<Outbound<TraceSpan>>) -> ReplayResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut accepted = 0;
        let mut last_error = None;
        for service_batch in self.build_batches(&batch) {
            match self.post(&service_batch).await {
                Ok(()) => accepted += service_batch.spans.len(),
                Err(e) => {
                    warn!(
                        service = %service_batch.process.service_name,
                        spans = service_batch.spans.len(),
                        error = %e,
                        "jaeger rejected service batch"
                    );
                    last_error = Some(e);
                }
            }
        }
        match (accepted, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(accepted),
        }
    }
}
