//! Prometheus remote-write sink

use super::remote_write::{
    TimeSeries, WriteRequest, CONTENT_ENCODING, CONTENT_TYPE, REMOTE_WRITE_VERSION,
};
use super::{ensure_success, join_url, Outbound, RecordSink};
use crate::config::RemoteWriteCompression;
use crate::dataset::records::{sanitize_label_name, sanitize_metric_name};
use crate::dataset::{Labels, MetricSample};
use crate::error::{ReplayError, ReplayResult};
use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING as CONTENT_ENCODING_HEADER, CONTENT_TYPE as CONTENT_TYPE_HEADER};
use std::collections::BTreeMap;
use tracing::debug;

/// Samples per metric name per remote-write request.
pub const METRIC_BATCH_SIZE: usize = 500;

const BACKEND: &str = "prometheus";

#[derive(Debug)]
pub struct PrometheusRemoteWrite {
    client: reqwest::Client,
    write_url: String,
    namespace: String,
    compression: RemoteWriteCompression,
}

impl PrometheusRemoteWrite {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        namespace: &str,
        compression: RemoteWriteCompression,
    ) -> Self {
        Self {
            client,
            write_url: join_url(base_url, "api/v1/write"),
            namespace: namespace.to_string(),
            compression,
        }
    }

    /// Group samples by full label set (`__name__`, namespace, is_history
    /// included) into time series.
    pub fn build_request(&self, batch: &[Outbound<MetricSample>]) -> WriteRequest {
        let mut series: BTreeMap<Labels, TimeSeries> = BTreeMap::new();
        for item in batch {
            let mut labels: Labels = item
                .record
                .labels
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (sanitize_label_name(k), v.clone()))
                .collect();
            labels.insert("__name__".into(), sanitize_metric_name(&item.record.metric_name));
            labels.insert("namespace".into(), self.namespace.clone());
            labels.insert("is_history".into(), item.is_history.to_string());

            let timestamp_ms = (item.timestamp * 1000.0).round() as i64;
            series
                .entry(labels)
                .or_insert_with_key(|labels| TimeSeries::new(labels.clone()))
                .push(timestamp_ms, item.record.value);
        }
        WriteRequest {
            timeseries: series.into_values().collect(),
        }
    }

    pub async fn send(&self, request: &WriteRequest) -> ReplayResult<()> {
        let mut builder = self
            .client
            .post(&self.write_url)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION);
        let body = match self.compression {
            RemoteWriteCompression::Snappy => {
                builder = builder.header(CONTENT_ENCODING_HEADER, CONTENT_ENCODING);
                request.encode_snappy()?
            }
            RemoteWriteCompression::None => request.encode(),
        };

        let resp = builder
            .body(body)
            .send()
            .await
            .map_err(|e| ReplayError::backend(BACKEND, e.to_string()))?;
        ensure_success(BACKEND, resp).await?;
        debug!(
            series = request.timeseries.len(),
            samples = request.sample_count(),
            "remote write accepted"
        );
        Ok(())
    }
}

#[async_trait]
impl RecordSink<MetricSample> for PrometheusRemoteWrite {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn batch_size(&self) -> usize {
        METRIC_BATCH_SIZE
    }

    async fn submit(&self, batch: Vec<Outbound<MetricSample>>) -> ReplayResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let request = self.build_request(&batch);
        self.send(&request).await?;
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> PrometheusRemoteWrite {
        PrometheusRemoteWrite::new(
            reqwest::Client::new(),
            "http://localhost:9090/",
            "bench",
            RemoteWriteCompression::Snappy,
        )
    }

    fn outbound(name: &str, pod: &str, ts: f64, value: f64) -> Outbound<MetricSample> {
        Outbound {
            record: MetricSample {
                timestamp: ts - 100.0,
                metric_name: name.into(),
                value,
                labels: [("pod".to_string(), pod.to_string())].into(),
            },
            timestamp: ts,
            is_history: true,
        }
    }

    #[test]
    fn test_write_url() {
        assert_eq!(sink().write_url, "http://localhost:9090/api/v1/write");
    }

    #[test]
    fn test_samples_grouped_by_label_set() {
        let batch = vec![
            outbound("cpu", "a-0", 10.0, 1.0),
            outbound("cpu", "b-0", 10.0, 2.0),
            outbound("cpu", "a-0", 11.5, 3.0),
        ];
        let request = sink().build_request(&batch);
        assert_eq!(request.timeseries.len(), 2);
        assert_eq!(request.sample_count(), 3);

        let a = &request.timeseries[0];
        assert_eq!(a.labels["__name__"], "cpu");
        assert_eq!(a.labels["pod"], "a-0");
        assert_eq!(a.labels["namespace"], "bench");
        assert_eq!(a.labels["is_history"], "true");
        assert_eq!(a.samples[1].timestamp_ms, 11_500);
        assert_eq!(a.samples[1].value, 3.0);
    }
}
