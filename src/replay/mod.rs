//! Paced realtime replay
//!
//! Each telemetry type gets its own [`Replayer`] running as an independent
//! task with its own start clock. A record at original time `ts` is due
//! `(ts - anchor_original) / speed` after that clock started; the replayer
//! sleeps until then, racing the session cancel signal.
//!
//! Emission is batched. The buffer is flushed before every sleep, when a
//! bucket reaches `max_batch`, or when `flush_interval` has passed since the
//! last flush, whichever comes first.

pub mod cancel;

pub use cancel::{cancellation, CancelHandle, CancelToken};

use crate::backend::elasticsearch::ElasticsearchBulk;
use crate::backend::jaeger::JaegerCollector;
use crate::backend::prometheus::PrometheusRemoteWrite;
use crate::backend::{Outbound, RecordSink};
use crate::config::ReplayConfig;
use crate::dataset::{BatchKey, LogEntry, MetricSample, RecordStream, Timestamped, TraceSpan};
use crate::loader::{deliver, Delivery, KeyedBuffer};
use crate::time_mapping::TimeRemapper;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub type TraceReplayer = Replayer<TraceSpan, Arc<JaegerCollector>>;
pub type LogReplayer = Replayer<LogEntry, Arc<ElasticsearchBulk>>;
pub type MetricReplayer = Replayer<MetricSample, Arc<PrometheusRemoteWrite>>;

// ============================================================================
// Pacing
// ============================================================================

/// Maps original timestamps onto wall-clock deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    origin: f64,
    speed: f64,
    started: Instant,
}

impl Pacer {
    /// Start the clock now. `speed` must be positive.
    pub fn start(origin: f64, speed: f64) -> Self {
        Self {
            origin,
            speed,
            started: Instant::now(),
        }
    }

    /// Real time that should have passed when `ts` is emitted.
    pub fn target(&self, ts: f64) -> Duration {
        let target = (ts - self.origin) / self.speed;
        if target.is_finite() && target > 0.0 {
            Duration::from_secs_f64(target)
        } else {
            Duration::ZERO
        }
    }

    /// How long to wait before emitting `ts`; zero when already due.
    pub fn delay_until(&self, ts: f64) -> Duration {
        self.target(ts).saturating_sub(self.started.elapsed())
    }

    /// How far behind schedule `ts` is being emitted.
    pub fn lag(&self, ts: f64) -> Duration {
        self.started.elapsed().saturating_sub(self.target(ts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOptions {
    pub max_batch: usize,
    pub flush_interval: Duration,
}

impl StreamOptions {
    /// Realtime batching bounded by both the config and the sink's limit.
    pub fn from_config(config: &ReplayConfig, sink_batch_size: usize) -> Self {
        let interval = if config.streaming_interval_seconds.is_finite()
            && config.streaming_interval_seconds > 0.0
        {
            Duration::from_secs_f64(config.streaming_interval_seconds)
        } else {
            Duration::from_secs(1)
        };
        Self {
            max_batch: config.stream_batch_size.clamp(1, sink_batch_size.max(1)),
            flush_interval: interval,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&ReplayConfig::default(), usize::MAX)
    }
}

// ============================================================================
// Replayer
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub backend: &'static str,
    /// Records in the realtime part of the timeline.
    pub selected: u64,
    #[serde(flatten)]
    pub delivery: Delivery,
    /// Buffered records discarded on cancellation.
    pub dropped: u64,
    pub cancelled: bool,
    pub max_lag_ms: u64,
    pub elapsed_ms: u64,
}

impl ReplayReport {
    pub fn replayed(&self) -> u64 {
        self.delivery.accepted
    }
}

pub struct Replayer<T, S> {
    sink: S,
    options: StreamOptions,
    _records: PhantomData<fn() -> T>,
}

impl<T, S> Replayer<T, S>
where
    T: Timestamped + BatchKey + Send + 'static,
    S: RecordSink<T>,
{
    pub fn new(sink: S, options: StreamOptions) -> Self {
        Self {
            sink,
            options,
            _records: PhantomData,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn flush(&self, buffer: &mut KeyedBuffer<T>, report: &mut ReplayReport) {
        for batch in buffer.drain() {
            deliver(&self.sink, batch, &mut report.delivery).await;
        }
    }

    /// Stream every realtime record at `speed_factor` times recorded pace.
    /// On cancellation, records still buffered are dropped.
    pub async fn replay(
        &self,
        mut records: RecordStream<T>,
        remapper: &TimeRemapper,
        speed_factor: f64,
        cancel: &CancelToken,
    ) -> ReplayReport {
        let mut report = ReplayReport {
            backend: self.sink.backend(),
            ..ReplayReport::default()
        };
        let pacer = Pacer::start(remapper.anchor_original(), speed_factor);
        let mut buffer = KeyedBuffer::new(self.options.max_batch);
        let mut last_flush = Instant::now();
        let mut max_lag = Duration::ZERO;

        'stream: loop {
            let next = tokio::select! {
                chunk = records.next_batch() => Some(chunk),
                _ = cancel.cancelled() => None,
            };
            let Some(chunk) = next else {
                report.cancelled = true;
                break;
            };
            let Some(chunk) = chunk else {
                break;
            };

            for record in chunk {
                let ts = record.timestamp();
                if !remapper.selects_for_stream(ts) {
                    continue;
                }
                report.selected += 1;

                let delay = pacer.delay_until(ts);
                if !delay.is_zero() {
                    self.flush(&mut buffer, &mut report).await;
                    last_flush = Instant::now();
                    if !cancel.sleep(delay).await {
                        report.cancelled = true;
                        break 'stream;
                    }
                } else {
                    max_lag = max_lag.max(pacer.lag(ts));
                }

                let item = Outbound {
                    timestamp: remapper.remap(ts),
                    is_history: remapper.is_history(ts),
                    record,
                };
                if let Some(full) = buffer.push(item) {
                    deliver(&self.sink, full, &mut report.delivery).await;
                }
                if last_flush.elapsed() >= self.options.flush_interval {
                    self.flush(&mut buffer, &mut report).await;
                    last_flush = Instant::now();
                }
            }
        }

        if report.cancelled {
            report.dropped = buffer.len() as u64;
            debug!(backend = report.backend, dropped = report.dropped, "replay cancelled");
        } else {
            self.flush(&mut buffer, &mut report).await;
        }

        report.max_lag_ms = max_lag.as_millis() as u64;
        report.elapsed_ms = pacer.started.elapsed().as_millis() as u64;
        info!(
            backend = report.backend,
            selected = report.selected,
            replayed = report.replayed(),
            failed_batches = report.delivery.failed_batches,
            cancelled = report.cancelled,
            max_lag_ms = report.max_lag_ms,
            "▶️ replay finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingMode;
    use crate::error::ReplayResult;
    use crate::loader::tests::{remapper, sample, ANCHOR, NOW};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the virtual time of every submission.
    struct ClockSink {
        started: Instant,
        calls: Mutex<Vec<(Duration, Vec<Outbound<MetricSample>>)>>,
    }

    impl ClockSink {
        fn new() -> Self {
            Self {
                started: Instant::now(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Duration, Vec<Outbound<MetricSample>>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordSink<MetricSample> for ClockSink {
        fn backend(&self) -> &'static str {
            "clock"
        }

        fn batch_size(&self) -> usize {
            500
        }

        async fn submit(&self, batch: Vec<Outbound<MetricSample>>) -> ReplayResult<usize> {
            let n = batch.len();
            self.calls.lock().unwrap().push((self.started.elapsed(), batch));
            Ok(n)
        }
    }

    fn options(max_batch: usize, flush_secs: u64) -> StreamOptions {
        StreamOptions {
            max_batch,
            flush_interval: Duration::from_secs(flush_secs),
        }
    }

    #[test]
    fn test_pacer_target_scales_with_speed() {
        let pacer = Pacer::start(100.0, 4.0);
        assert_eq!(pacer.target(140.0), Duration::from_secs(10));
        assert_eq!(pacer.target(90.0), Duration::ZERO);
    }

    #[test]
    fn test_stream_options_capped_by_sink() {
        let config = ReplayConfig {
            stream_batch_size: 5000,
            streaming_interval_seconds: 0.5,
            ..ReplayConfig::default()
        };
        let opts = StreamOptions::from_config(&config, 1000);
        assert_eq!(opts.max_batch, 1000);
        assert_eq!(opts.flush_interval, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_bound() {
        let sink = Arc::new(ClockSink::new());
        let replayer = Replayer::new(sink.clone(), options(100, 60));
        let records = RecordStream::from_batches(vec![
            vec![sample("cpu", ANCHOR - 5.0), sample("cpu", ANCHOR), sample("cpu", ANCHOR + 10.0)],
            vec![sample("cpu", ANCHOR + 20.0)],
        ]);

        let started = Instant::now();
        let report = replayer
            .replay(records, &remapper(MappingMode::Realtime), 2.0, &CancelToken::never())
            .await;
        let elapsed = started.elapsed();

        // 20s of data at 2x: 10s of real time.
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_millis(10_050));
        assert_eq!(report.selected, 3);
        assert_eq!(report.replayed(), 3);
        assert!(!report.cancelled);

        let calls = sink.calls();
        assert_eq!(calls.len(), 3);
        let at: Vec<u64> = calls.iter().map(|(t, _)| t.as_secs()).collect();
        assert_eq!(at, vec![0, 5, 10]);
        assert_eq!(calls[0].1[0].timestamp, NOW);
        assert!(!calls[0].1[0].is_history);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayers_pace_independently() {
        let remapper = remapper(MappingMode::Realtime);
        let sinks = [Arc::new(ClockSink::new()), Arc::new(ClockSink::new())];
        let started = Instant::now();

        let mut set = tokio::task::JoinSet::new();
        for (sink, name) in sinks.iter().zip(["cpu", "log_rate"]) {
            let replayer = Replayer::new(sink.clone(), options(100, 60));
            let records = RecordStream::from_batches(vec![vec![sample(name, ANCHOR + 10.0)]]);
            let remapper = remapper.clone();
            set.spawn(async move { replayer.replay(records, &remapper, 1.0, &CancelToken::never()).await });
        }
        while let Some(report) = set.join_next().await {
            assert_eq!(report.unwrap().replayed(), 1);
        }

        // Both 10s waits overlap: 10s total, not 20s.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
        for sink in &sinks {
            assert_eq!(sink.calls()[0].0.as_secs(), 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_records_batched_until_size() {
        let sink = Arc::new(ClockSink::new());
        let replayer = Replayer::new(sink.clone(), options(2, 60));
        let records = RecordStream::from_batches(vec![(0..5).map(|_| sample("cpu", ANCHOR)).collect()]);
        let report = replayer
            .replay(records, &remapper(MappingMode::Realtime), 1.0, &CancelToken::never())
            .await;
        let sizes: Vec<usize> = sink.calls().iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(report.delivery.batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_long_wait() {
        let sink = Arc::new(ClockSink::new());
        let replayer = Replayer::new(sink.clone(), options(100, 60));
        let records = RecordStream::from_batches(vec![vec![
            sample("cpu", ANCHOR),
            sample("cpu", ANCHOR + 3600.0),
        ]]);
        let handle = cancellation();
        let token = handle.token();
        let remapper = remapper(MappingMode::Realtime);

        let started = Instant::now();
        let run = tokio::spawn(async move { replayer.replay(records, &remapper, 1.0, &token).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let report = run.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.cancelled);
        assert_eq!(report.replayed(), 1);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_streams_after_init_window() {
        let sink = Arc::new(ClockSink::new());
        let replayer = Replayer::new(sink.clone(), options(100, 60));
        let tail = ANCHOR + 1800.0 + 1.0;
        let records = RecordStream::from_batches(vec![vec![
            sample("cpu", ANCHOR + 100.0),
            sample("mem", tail),
        ]]);
        let report = replayer
            .replay(records, &remapper(MappingMode::Windowed), 100.0, &CancelToken::never())
            .await;
        assert_eq!(report.selected, 1);
        let calls = sink.calls();
        assert_eq!(calls[0].1[0].timestamp, tail);
        assert_eq!(calls[0].1[0].record.metric_name, "mem");
    }
}
