//! Bulk history loading
//!
//! Drains a [`RecordStream`], keeps the records the remapper assigns to the
//! bulk phase, shifts their timestamps and pushes them to a backend in
//! fixed-size batches. Delivery is best effort: a rejected batch is logged
//! and the load moves on.

use crate::backend::elasticsearch::ElasticsearchBulk;
use crate::backend::jaeger::JaegerCollector;
use crate::backend::prometheus::PrometheusRemoteWrite;
use crate::backend::{Outbound, RecordSink};
use crate::dataset::{BatchKey, LogEntry, MetricSample, RecordStream, Timestamped, TraceSpan};
use crate::replay::CancelToken;
use crate::time_mapping::TimeRemapper;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub type TraceLoader = BulkLoader<TraceSpan, Arc<JaegerCollector>>;
pub type LogLoader = BulkLoader<LogEntry, Arc<ElasticsearchBulk>>;
pub type MetricLoader = BulkLoader<MetricSample, Arc<PrometheusRemoteWrite>>;

// ============================================================================
// Delivery accounting
// ============================================================================

/// Submission tally shared by loaders and replayers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Records handed to the sink.
    pub submitted: u64,
    /// Records the backend confirmed.
    pub accepted: u64,
    pub batches: u64,
    pub failed_batches: u64,
}

/// Submit one batch and fold the outcome into `tally`. Never retries.
pub(crate) async fn deliver<T, S>(sink: &S, batch: Vec<Outbound<T>>, tally: &mut Delivery)
where
    T: Send + 'static,
    S: RecordSink<T>,
{
    if batch.is_empty() {
        return;
    }
    let size = batch.len() as u64;
    tally.submitted += size;
    tally.batches += 1;
    match sink.submit(batch).await {
        Ok(accepted) => {
            tally.accepted += accepted as u64;
            debug!(backend = sink.backend(), size, accepted, "batch delivered");
        }
        Err(e) => {
            tally.failed_batches += 1;
            warn!(backend = sink.backend(), size, error = %e, "batch rejected, skipping");
        }
    }
}

// ============================================================================
// Keyed batching
// ============================================================================

/// Outbound records bucketed by [`BatchKey`]; a bucket is handed back once
/// it reaches `limit`.
pub(crate) struct KeyedBuffer<T> {
    buckets: BTreeMap<String, Vec<Outbound<T>>>,
    limit: usize,
    len: usize,
}

impl<T: BatchKey> KeyedBuffer<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            limit: limit.max(1),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a record; returns its bucket when that bucket is full.
    pub(crate) fn push(&mut self, item: Outbound<T>) -> Option<Vec<Outbound<T>>> {
        let bucket = self
            .buckets
            .entry(item.record.batch_key().to_string())
            .or_default();
        bucket.push(item);
        self.len += 1;
        if bucket.len() >= self.limit {
            let full = std::mem::take(bucket);
            self.len -= full.len();
            Some(full)
        } else {
            None
        }
    }

    /// Take every non-empty bucket.
    pub(crate) fn drain(&mut self) -> Vec<Vec<Outbound<T>>> {
        self.len = 0;
        std::mem::take(&mut self.buckets)
            .into_values()
            .filter(|b| !b.is_empty())
            .collect()
    }
}

// ============================================================================
// Bulk loader
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub backend: &'static str,
    /// Records read from the dataset.
    pub scanned: u64,
    /// Records inside the bulk window.
    pub selected: u64,
    #[serde(flatten)]
    pub delivery: Delivery,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl LoadReport {
    /// Records confirmed by the backend.
    pub fn loaded(&self) -> u64 {
        self.delivery.accepted
    }
}

pub struct BulkLoader<T, S> {
    sink: S,
    _records: PhantomData<fn() -> T>,
}

impl<T, S> BulkLoader<T, S>
where
    T: Timestamped + BatchKey + Send + 'static,
    S: RecordSink<T>,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            _records: PhantomData,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Load every bulk-phase record from `records`. Cancellation stops
    /// reading; whatever is already buffered is still flushed.
    pub async fn bulk_load(
        &self,
        mut records: RecordStream<T>,
        remapper: &TimeRemapper,
        cancel: &CancelToken,
    ) -> LoadReport {
        let started = Instant::now();
        let mut report = LoadReport {
            backend: self.sink.backend(),
            ..LoadReport::default()
        };
        let mut buffer = KeyedBuffer::new(self.sink.batch_size());

        while let Some(chunk) = records.next_batch().await {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.scanned += chunk.len() as u64;
            for record in chunk {
                let ts = record.timestamp();
                if !remapper.selects_for_bulk(ts) {
                    continue;
                }
                report.selected += 1;
                let item = Outbound {
                    timestamp: remapper.remap(ts),
                    is_history: remapper.is_history(ts),
                    record,
                };
                if let Some(full) = buffer.push(item) {
                    deliver(&self.sink, full, &mut report.delivery).await;
                }
            }
        }
        for rest in buffer.drain() {
            deliver(&self.sink, rest, &mut report.delivery).await;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            backend = report.backend,
            scanned = report.scanned,
            selected = report.selected,
            loaded = report.loaded(),
            failed_batches = report.delivery.failed_batches,
            elapsed_ms = report.elapsed_ms,
            "📦 bulk load finished"
        );
        report
    }
}
