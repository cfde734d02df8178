//! Normalized telemetry records
//!
//! Every adapter maps its dataset onto these three shapes. Timestamps are
//! float epoch seconds regardless of the source unit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sorted, unique label/tag set.
pub type Labels = BTreeMap<String, String>;

pub trait Timestamped {
    fn timestamp(&self) -> f64;
}

/// Grouping key used when batching for a backend. Metrics batch per metric
/// name; logs and spans share one batch.
pub trait BatchKey {
    fn batch_key(&self) -> &str {
        ""
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub timestamp: f64,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub operation_name: String,
    pub duration_ms: f64,
    pub tags: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub log_id: String,
    pub cmdb_id: String,
    pub level: String,
    pub message: String,
    pub tags: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: f64,
    pub metric_name: String,
    pub value: f64,
    pub labels: Labels,
}

impl Timestamped for TraceSpan {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for LogEntry {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for MetricSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl BatchKey for TraceSpan {}

impl BatchKey for LogEntry {}

impl BatchKey for MetricSample {
    fn batch_key(&self) -> &str {
        &self.metric_name
    }
}

/// Owning service of a component id: `frontend-2` -> `frontend`.
///
/// Only a trailing `-<digits>` instance suffix is removed, so `adservice-grpc`
/// keeps its name. A `node.pod` id resolves through its pod part.
pub fn service_from_component(cmdb_id: &str) -> String {
    let pod = split_node_pod(cmdb_id).map(|(_, pod)| pod).unwrap_or(cmdb_id);
    match pod.rsplit_once('-') {
        Some((service, suffix))
            if !service.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            service.to_string()
        }
        _ => pod.to_string(),
    }
}

/// `node-6.adservice2-0` -> `("node-6", "adservice2-0")`.
pub fn split_node_pod(cmdb_id: &str) -> Option<(&str, &str)> {
    let (node, pod) = cmdb_id.split_once('.')?;
    if node.is_empty() || pod.is_empty() {
        None
    } else {
        Some((node, pod))
    }
}

/// Map to the Prometheus name charset `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Label names use the metric charset minus `:`.
pub fn sanitize_label_name(name: &str) -> String {
    sanitize_metric_name(name).replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_from_component() {
        assert_eq!(service_from_component("frontend-2"), "frontend");
        assert_eq!(service_from_component("adservice2-0"), "adservice2");
        assert_eq!(service_from_component("adservice-grpc"), "adservice-grpc");
        assert_eq!(service_from_component("node-6.adservice2-0"), "adservice2");
        assert_eq!(service_from_component("Tomcat01"), "Tomcat01");
    }

    #[test]
    fn test_split_node_pod() {
        assert_eq!(
            split_node_pod("node-6.adservice2-0"),
            Some(("node-6", "adservice2-0"))
        );
        assert_eq!(split_node_pod("adservice2-0"), None);
    }

    #[test]
    fn test_sanitize_names() {
        assert_eq!(
            sanitize_metric_name("container_cpu_usage_seconds"),
            "container_cpu_usage_seconds"
        );
        assert_eq!(sanitize_metric_name("OSLinux-CPU_CPU_CPUCpuUtil"), "OSLinux_CPU_CPU_CPUCpuUtil");
        assert_eq!(sanitize_metric_name("1m load"), "_1m_load");
        assert_eq!(sanitize_label_name("k8s:pod"), "k8s_pod");
    }

    #[test]
    fn test_metric_batch_key_is_name() {
        let sample = MetricSample {
            timestamp: 1.0,
            metric_name: "cpu".into(),
            value: 1.0,
            labels: Labels::new(),
        };
        assert_eq!(sample.batch_key(), "cpu");
    }
}
