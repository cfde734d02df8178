//! Telemetry observer
//!
//! Read-back side of a replay: queries the three stores over the replayed
//! namespace and normalizes the answers into the same record shapes the
//! loaders emit, so callers can compare what went in with what came out.

use crate::backend::{ensure_success, http_client, join_url};
use crate::config::{BackendConfig, DatasetConfig};
use crate::dataset::records::service_from_component;
use crate::dataset::{Labels, LogEntry, MetricSample, TraceSpan};
use crate::error::{ReplayError, ReplayResult};
use crate::time_mapping::{parse_iso_utc, MICROS_PER_SEC};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Resolution of metric range queries.
pub const METRIC_STEP_SECS: u64 = 60;
/// Upper bound on traces per service and on log hits per query.
pub const MAX_RESULTS: usize = 1000;

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    metric: Labels,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct JaegerResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct JaegerTrace {
    #[serde(default)]
    spans: Vec<JaegerSpanOut>,
    #[serde(default)]
    processes: HashMap<String, JaegerProcessOut>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerSpanOut {
    #[serde(rename = "traceID")]
    trace_id: String,
    #[serde(rename = "spanID")]
    span_id: String,
    operation_name: String,
    #[serde(default)]
    references: Vec<JaegerRefOut>,
    start_time: i64,
    duration: i64,
    #[serde(rename = "processID", default)]
    process_id: String,
    #[serde(default)]
    tags: Vec<JaegerKeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerRefOut {
    ref_type: String,
    #[serde(rename = "spanID")]
    span_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerProcessOut {
    service_name: String,
}

#[derive(Debug, Deserialize)]
struct JaegerKeyValue {
    key: String,
    value: Value,
}

fn value_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Flatten a `query_range` matrix into samples, skipping unparseable values.
pub fn parse_matrix(body: &str) -> ReplayResult<Vec<MetricSample>> {
    let resp: PromResponse = serde_json::from_str(body)
        .map_err(|e| ReplayError::backend("prometheus", format!("unreadable query response: {}", e)))?;
    if resp.status != "success" {
        return Err(ReplayError::backend(
            "prometheus",
            resp.error.unwrap_or_else(|| format!("query status {}", resp.status)),
        ));
    }
    let mut samples = Vec::new();
    for series in resp.data.map(|d| d.result).unwrap_or_default() {
        let mut labels = series.metric;
        let metric_name = labels.remove("__name__").unwrap_or_default();
        for (ts, raw) in series.values {
            let Ok(value) = raw.parse::<f64>() else {
                continue;
            };
            samples.push(MetricSample {
                timestamp: ts,
                metric_name: metric_name.clone(),
                value,
                labels: labels.clone(),
            });
        }
    }
    Ok(samples)
}

/// Jaeger query API traces to spans. Ids are Jaeger's hex ids.
pub fn parse_jaeger_traces(body: &str) -> ReplayResult<Vec<TraceSpan>> {
    let resp: JaegerResponse<JaegerTrace> = serde_json::from_str(body)
        .map_err(|e| ReplayError::backend("jaeger", format!("unreadable traces response: {}", e)))?;
    let mut spans = Vec::new();
    for trace in resp.data {
        for span in trace.spans {
            let service = trace
                .processes
                .get(&span.process_id)
                .map(|p| p.service_name.clone())
                .unwrap_or_default();
            let parent_span_id = span
                .references
                .iter()
                .find(|r| r.ref_type == "CHILD_OF")
                .map(|r| r.span_id.clone());
            let tags: Labels = span
                .tags
                .iter()
                .map(|kv| (kv.key.clone(), value_string(&kv.value)))
                .collect();
            spans.push(TraceSpan {
                timestamp: span.start_time as f64 / MICROS_PER_SEC,
                trace_id: span.trace_id,
                span_id: span.span_id,
                parent_span_id,
                service,
                operation_name: span.operation_name,
                duration_ms: span.duration as f64 / 1000.0,
                tags,
            });
        }
    }
    spans.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    Ok(spans)
}

/// `_search` hits to log entries; hits without a parseable `@timestamp`
/// are dropped.
pub fn parse_search_hits(body: &str) -> ReplayResult<Vec<LogEntry>> {
    let resp: Value = serde_json::from_str(body)
        .map_err(|e| ReplayError::backend("elasticsearch", format!("unreadable search response: {}", e)))?;
    let hits = resp
        .pointer("/hits/hits")
        .and_then(|h| h.as_array())
        .cloned()
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(source) = hit.get("_source").and_then(|s| s.as_object()) else {
            continue;
        };
        let Some(timestamp) = source
            .get("@timestamp")
            .and_then(|t| t.as_str())
            .and_then(parse_iso_utc)
        else {
            continue;
        };
        let text = |key: &str| source.get(key).map(value_string).unwrap_or_default();
        let tags: Labels = source
            .iter()
            .filter(|(k, _)| {
                !matches!(k.as_str(), "@timestamp" | "log_id" | "cmdb_id" | "log_level" | "message")
            })
            .map(|(k, v)| (k.clone(), value_string(v)))
            .collect();
        entries.push(LogEntry {
            timestamp,
            log_id: text("log_id"),
            cmdb_id: text("cmdb_id"),
            level: text("log_level"),
            message: text("message"),
            tags,
        });
    }
    Ok(entries)
}

/// Regex-escape `raw` for use inside a double-quoted PromQL string.
fn promql_regex_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' => {
                out.push_str("\\\\");
                out.push(c);
            }
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// PromQL selector for the namespace, optionally narrowed to components.
pub fn metric_selector(namespace: &str, component: Option<&str>) -> String {
    match component {
        Some(c) => format!(
            "{{namespace=\"{}\",cmdb_id=~\".*{}.*\"}}",
            namespace,
            promql_regex_literal(c)
        ),
        None => format!("{{namespace=\"{}\"}}", namespace),
    }
}

/// Elasticsearch query body over a remapped time range.
pub fn search_body(start: f64, end: f64, component: Option<&str>) -> Value {
    let mut filter = vec![json!({
        "range": {
            "@timestamp": {
                "gte": (start * 1000.0).round() as i64,
                "lte": (end * 1000.0).round() as i64,
                "format": "epoch_millis"
            }
        }
    })];
    if let Some(c) = component {
        filter.push(json!({ "match": { "cmdb_id": c } }));
    }
    json!({
        "size": MAX_RESULTS,
        "sort": [{ "@timestamp": "asc" }],
        "query": { "bool": { "filter": filter } }
    })
}

// ============================================================================
// Observer
// ============================================================================

pub struct TelemetryObserver {
    client: reqwest::Client,
    backends: BackendConfig,
    namespace: String,
}

impl TelemetryObserver {
    pub fn new(client: reqwest::Client, backends: BackendConfig, namespace: &str) -> Self {
        Self {
            client,
            backends,
            namespace: namespace.to_string(),
        }
    }

    pub fn from_config(config: &DatasetConfig) -> ReplayResult<Self> {
        Ok(Self::new(
            http_client(&config.backends)?,
            config.backends.clone(),
            &config.namespace,
        ))
    }

    async fn get_text(&self, backend: &'static str, req: reqwest::RequestBuilder) -> ReplayResult<String> {
        let resp = req
            .send()
            .await
            .map_err(|e| ReplayError::backend(backend, e.to_string()))?;
        let resp = ensure_success(backend, resp).await?;
        resp.text()
            .await
            .map_err(|e| ReplayError::backend(backend, e.to_string()))
    }

    /// Samples in `[start, end]` (epoch seconds) at a 60 s step.
    pub async fn query_metrics(
        &self,
        start: f64,
        end: f64,
        component: Option<&str>,
    ) -> ReplayResult<Vec<MetricSample>> {
        let url = join_url(&self.backends.prometheus_url, "api/v1/query_range");
        let selector = metric_selector(&self.namespace, component);
        debug!(%selector, start, end, "querying metrics");
        let req = self.client.get(url).query(&[
            ("query", selector),
            ("start", format!("{:.3}", start)),
            ("end", format!("{:.3}", end)),
            ("step", format!("{}s", METRIC_STEP_SECS)),
        ]);
        parse_matrix(&self.get_text("prometheus", req).await?)
    }

    /// Spans in `[start, end]`. Without a component every service the query
    /// API knows is searched.
    pub async fn query_traces(
        &self,
        start: f64,
        end: f64,
        component: Option<&str>,
    ) -> ReplayResult<Vec<TraceSpan>> {
        let services = match component {
            Some(c) => vec![service_from_component(c)],
            None => self.services().await?,
        };
        let url = join_url(&self.backends.jaeger_query_url, "api/traces");
        let mut spans = Vec::new();
        for service in services {
            let req = self.client.get(&url).query(&[
                ("service", service.clone()),
                ("start", ((start * MICROS_PER_SEC) as i64).to_string()),
                ("end", ((end * MICROS_PER_SEC) as i64).to_string()),
                ("limit", MAX_RESULTS.to_string()),
            ]);
            match self.get_text("jaeger", req).await.and_then(|b| parse_jaeger_traces(&b)) {
                Ok(found) => spans.extend(found),
                Err(e) => warn!(%service, error = %e, "trace query failed"),
            }
        }
        spans.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(spans)
    }

    /// Services known to the Jaeger query API, minus Jaeger's own.
    pub async fn services(&self) -> ReplayResult<Vec<String>> {
        let url = join_url(&self.backends.jaeger_query_url, "api/services");
        let body = self.get_text("jaeger", self.client.get(url)).await?;
        let resp: JaegerResponse<String> = serde_json::from_str(&body)
            .map_err(|e| ReplayError::backend("jaeger", format!("unreadable services response: {}", e)))?;
        Ok(resp
            .data
            .into_iter()
            .filter(|s| !s.starts_with("jaeger"))
            .collect())
    }

    /// Log entries in `[start, end]` from this namespace's indices.
    pub async fn query_logs(
        &self,
        start: f64,
        end: f64,
        component: Option<&str>,
    ) -> ReplayResult<Vec<LogEntry>> {
        let index = format!("logstash-{}-*", self.namespace);
        let url = join_url(&self.backends.elasticsearch_url, &format!("{}/_search", index));
        let req = self.client.post(url).json(&search_body(start, end, component));
        parse_search_hits(&self.get_text("elasticsearch", req).await?)
    }
}
