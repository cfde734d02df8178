//! OpenRCA dataset adapter
//!
//! Layout on disk:
//!
//! ```text
//! <dataset_path>/
//!   query.csv, record.csv
//!   telemetry/
//!     2022_03_20/
//!       trace/trace_span.csv          (or trace_span.csv directly in the day)
//!       log/log_service.csv
//!       metric/metric_service.csv ...
//! ```
//!
//! The three sub-datasets (Market, Bank, Telecom) disagree on column names,
//! timestamp units and metric layout. Each file's header row picks its
//! normalizer:
//!
//! | kind   | detected by                  | output                                  |
//! |--------|------------------------------|-----------------------------------------|
//! | trace  | `trace_id`/`traceId` + span  | service from `serviceName` or cmdb_id   |
//! | log    | anything with a timestamp    | level inferred from the message         |
//! | metric | `itemid` + `name`            | keyed: name, labels itemid/bomc/cmdb    |
//! | metric | `kpi_name`                   | long: kpi_name, labels cmdb/service     |
//! | metric | entity column + value cols   | wide: `{file_stem}_{col}`, label service|
//!
//! Service names come from component ids by dropping a trailing `-<digits>`
//! instance suffix (`frontend-2` -> `frontend`).

use super::batches::{column, field, number, RecordBatches, RowNormalizer};
use super::records::{
    sanitize_metric_name, service_from_component, split_node_pod, Labels, LogEntry, MetricSample,
    TraceSpan,
};
use crate::config::{DatasetConfig, TelemetryKind};
use crate::error::{ReplayError, ReplayResult};
use crate::time_mapping::normalize_epoch;
use crate::time_mapping::openrca_query::OpenRcaQueryParser;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TIMESTAMP_COLUMNS: &[&str] = &["timestamp", "startTime", "start_time"];

#[derive(Debug, Clone)]
pub struct OpenRcaAdapter {
    dataset_name: String,
    days: Vec<PathBuf>,
    trace_files: Vec<String>,
    log_files: Vec<String>,
    metric_files: Vec<String>,
    chunk_rows: usize,
    query_file: PathBuf,
    record_file: PathBuf,
    source_utc_offset_hours: i32,
}

impl OpenRcaAdapter {
    pub fn new(config: &DatasetConfig) -> ReplayResult<Self> {
        let telemetry = config.dataset_path.join("telemetry");
        if !telemetry.is_dir() {
            return Err(ReplayError::config(format!(
                "dataset telemetry directory not found: {}",
                telemetry.display()
            )));
        }

        let start = config.replay.start_date.as_deref().map(day_key);
        let end = config.replay.end_date.as_deref().map(day_key);
        let mut days = Vec::new();
        for entry in std::fs::read_dir(&telemetry).map_err(|e| ReplayError::dataset(&telemetry, e))? {
            let path = entry.map_err(|e| ReplayError::dataset(&telemetry, e))?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(day_key) else {
                continue;
            };
            let after_start = start.as_ref().map_or(true, |s| name >= *s);
            let before_end = end.as_ref().map_or(true, |e| name <= *e);
            if after_start && before_end {
                days.push(path);
            }
        }
        days.sort();

        info!(
            dataset = %config.dataset_name,
            days = days.len(),
            "📂 OpenRCA dataset opened"
        );

        Ok(Self {
            dataset_name: config.dataset_name.clone(),
            days,
            trace_files: config.data_mapping.trace_files.clone(),
            log_files: config.data_mapping.log_files.clone(),
            metric_files: config.data_mapping.metric_files.clone(),
            chunk_rows: config.replay.chunk_rows,
            query_file: config.query_file_path(),
            record_file: config.record_file_path(),
            source_utc_offset_hours: config.query.source_utc_offset_hours,
        })
    }

    /// Existing files of one kind, day by day, in configured order.
    pub fn files_for(&self, kind: TelemetryKind) -> Vec<PathBuf> {
        let names = match kind {
            TelemetryKind::Trace => &self.trace_files,
            TelemetryKind::Log => &self.log_files,
            TelemetryKind::Metric => &self.metric_files,
        };
        let mut files = Vec::new();
        for day in &self.days {
            for name in names {
                let direct = day.join(name);
                let nested = day.join(kind.as_str()).join(name);
                if direct.is_file() {
                    files.push(direct);
                } else if nested.is_file() {
                    files.push(nested);
                } else {
                    debug!(day = %day.display(), file = %name, "file not present for day");
                }
            }
        }
        files
    }

    pub fn load_traces(&self) -> RecordBatches<TraceSpan> {
        RecordBatches::new(self.files_for(TelemetryKind::Trace), self.chunk_rows, trace_normalizer)
    }

    pub fn load_logs(&self) -> RecordBatches<LogEntry> {
        RecordBatches::new(self.files_for(TelemetryKind::Log), self.chunk_rows, log_normalizer)
    }

    pub fn load_metrics(&self) -> RecordBatches<MetricSample> {
        RecordBatches::new(self.files_for(TelemetryKind::Metric), self.chunk_rows, metric_normalizer)
    }

    pub fn query_parser(&self) -> ReplayResult<OpenRcaQueryParser> {
        OpenRcaQueryParser::new(
            &self.query_file,
            &self.record_file,
            self.source_utc_offset_hours,
            "openrca",
            &self.dataset_name,
        )
    }
}

/// `2022-03-20` and `2022_03_20` compare equal.
fn day_key(name: &str) -> String {
    name.trim().replace('-', "_")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("metric")
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn missing_columns(path: &Path, kind: &str, headers: &csv::StringRecord) -> ReplayError {
    ReplayError::dataset(
        path,
        format!(
            "unrecognized {} schema, columns: {}",
            kind,
            headers.iter().collect::<Vec<_>>().join(",")
        ),
    )
}

fn timestamp(row: &csv::StringRecord, idx: usize) -> Option<f64> {
    number(row, Some(idx)).map(normalize_epoch)
}

// =============================================================================
// TRACES
// =============================================================================

struct TraceColumns {
    timestamp: usize,
    trace_id: usize,
    span_id: usize,
    parent: Option<usize>,
    cmdb_id: Option<usize>,
    service: Option<usize>,
    operation: Option<usize>,
    duration: Option<usize>,
    status: Option<usize>,
    kind: Option<usize>,
}

fn trace_normalizer(
    path: &Path,
    headers: &csv::StringRecord,
) -> ReplayResult<Box<dyn RowNormalizer<TraceSpan>>> {
    let required = (
        column(headers, TIMESTAMP_COLUMNS),
        column(headers, &["trace_id", "traceId", "trace"]),
        column(headers, &["span_id", "spanId", "id"]),
    );
    let (Some(timestamp), Some(trace_id), Some(span_id)) = required else {
        return Err(missing_columns(path, "trace", headers));
    };
    Ok(Box::new(TraceColumns {
        timestamp,
        trace_id,
        span_id,
        parent: column(headers, &["parent_span_id", "parent_span", "parent_id", "pid"]),
        cmdb_id: column(headers, &["cmdb_id"]),
        service: column(headers, &["service", "serviceName", "service_name"]),
        operation: column(headers, &["operation_name", "dsName", "callType"]),
        duration: column(headers, &["duration", "elapsedTime", "elapsed_time"]),
        status: column(headers, &["status_code", "status", "success"]),
        kind: column(headers, &["type", "callType"]),
    }))
}

impl RowNormalizer<TraceSpan> for TraceColumns {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<TraceSpan>) {
        let (Some(ts), Some(trace_id), Some(span_id)) = (
            timestamp(row, self.timestamp),
            field(row, Some(self.trace_id)),
            field(row, Some(self.span_id)),
        ) else {
            return;
        };

        let cmdb_id = field(row, self.cmdb_id);
        let service = field(row, self.service)
            .map(str::to_string)
            .or_else(|| cmdb_id.map(service_from_component))
            .unwrap_or_else(|| "unknown".to_string());
        let parent_span_id = field(row, self.parent)
            .filter(|p| !matches!(*p, "None" | "none" | "null" | "-1" | "0"))
            .map(str::to_string);

        let mut tags = Labels::new();
        if let Some(cmdb) = cmdb_id {
            tags.insert("cmdb_id".into(), cmdb.to_string());
        }
        if let Some(status) = field(row, self.status) {
            tags.insert("status".into(), status.to_string());
            tags.insert("has_error".into(), status_is_error(status).to_string());
        }
        if let Some(kind) = field(row, self.kind) {
            tags.insert("span.kind".into(), kind.to_string());
        }

        out.push(TraceSpan {
            timestamp: ts,
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id,
            service,
            operation_name: field(row, self.operation).unwrap_or("unknown").to_string(),
            duration_ms: number(row, self.duration).unwrap_or(0.0),
            tags,
        });
    }
}

/// Telecom carries a `success` flag, Market a status code (0 or 2xx/3xx is ok).
fn status_is_error(status: &str) -> bool {
    match status.to_ascii_lowercase().as_str() {
        "true" => false,
        "false" => true,
        other => other
            .parse::<i64>()
            .map_or(false, |code| code != 0 && !(200..400).contains(&code)),
    }
}

// =============================================================================
// LOGS
// =============================================================================

struct LogColumns {
    timestamp: usize,
    log_id: Option<usize>,
    cmdb_id: Option<usize>,
    level: Option<usize>,
    message: Option<usize>,
    log_name: Option<usize>,
    source_file: String,
    log_type: String,
}

fn log_normalizer(
    path: &Path,
    headers: &csv::StringRecord,
) -> ReplayResult<Box<dyn RowNormalizer<LogEntry>>> {
    let Some(timestamp) = column(headers, TIMESTAMP_COLUMNS) else {
        return Err(missing_columns(path, "log", headers));
    };
    Ok(Box::new(LogColumns {
        timestamp,
        log_id: column(headers, &["log_id", "id"]),
        cmdb_id: column(headers, &["cmdb_id"]),
        level: column(headers, &["log_level", "level"]),
        message: column(headers, &["value", "message"]),
        log_name: column(headers, &["log_name"]),
        source_file: file_name(path),
        log_type: file_stem(path),
    }))
}

/// Severity keyword scan for datasets that do not record a level.
pub fn infer_level(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if ["error", "exception", "fatal", "severe"].iter().any(|k| lower.contains(k)) {
        "error"
    } else if lower.contains("warn") {
        "warning"
    } else {
        "info"
    }
}

impl RowNormalizer<LogEntry> for LogColumns {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<LogEntry>) {
        let Some(ts) = timestamp(row, self.timestamp) else {
            return;
        };
        let message = field(row, self.message).unwrap_or_default().to_string();
        let level = field(row, self.level)
            .map(|l| l.to_ascii_lowercase())
            .unwrap_or_else(|| infer_level(&message).to_string());

        let mut tags = Labels::new();
        if let Some(name) = field(row, self.log_name) {
            tags.insert("log_name".into(), name.to_string());
        }
        tags.insert("log_type".into(), self.log_type.clone());
        tags.insert("source_file".into(), self.source_file.clone());

        out.push(LogEntry {
            timestamp: ts,
            log_id: field(row, self.log_id).unwrap_or_default().to_string(),
            cmdb_id: field(row, self.cmdb_id).unwrap_or("unknown").to_string(),
            level,
            message,
            tags,
        });
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Row carries a synthetic item id and a separate human metric name.
struct KeyedMetric {
    timestamp: usize,
    name: usize,
    value: usize,
    itemid: usize,
    bomc_id: Option<usize>,
    cmdb_id: Option<usize>,
}

/// One `(entity, kpi_name, value)` triple per row.
struct LongMetric {
    timestamp: usize,
    kpi_name: usize,
    value: usize,
    cmdb_id: Option<usize>,
}

/// One entity plus several metric columns per row.
struct WideMetric {
    timestamp: usize,
    entity: usize,
    /// `(column index, metric name)`
    values: Vec<(usize, String)>,
}

fn metric_normalizer(
    path: &Path,
    headers: &csv::StringRecord,
) -> ReplayResult<Box<dyn RowNormalizer<MetricSample>>> {
    let Some(ts) = column(headers, TIMESTAMP_COLUMNS) else {
        return Err(missing_columns(path, "metric", headers));
    };
    let value = column(headers, &["value"]);

    if let (Some(itemid), Some(name), Some(value)) =
        (column(headers, &["itemid"]), column(headers, &["name"]), value)
    {
        return Ok(Box::new(KeyedMetric {
            timestamp: ts,
            name,
            value,
            itemid,
            bomc_id: column(headers, &["bomc_id"]),
            cmdb_id: column(headers, &["cmdb_id"]),
        }));
    }

    if let (Some(kpi_name), Some(value)) = (column(headers, &["kpi_name"]), value) {
        return Ok(Box::new(LongMetric {
            timestamp: ts,
            kpi_name,
            value,
            cmdb_id: column(headers, &["cmdb_id"]),
        }));
    }

    let Some(entity) = column(headers, &["service", "serviceName", "tc", "cmdb_id"]) else {
        return Err(missing_columns(path, "metric", headers));
    };
    let stem = file_stem(path);
    let values: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != ts && *i != entity)
        .map(|(i, h)| (i, sanitize_metric_name(&format!("{}_{}", stem, h.trim()))))
        .collect();
    if values.is_empty() {
        return Err(missing_columns(path, "metric", headers));
    }
    debug!(path = %path.display(), metrics = values.len(), "wide metric layout");
    Ok(Box::new(WideMetric {
        timestamp: ts,
        entity,
        values,
    }))
}

impl RowNormalizer<MetricSample> for KeyedMetric {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<MetricSample>) {
        let (Some(ts), Some(name), Some(value), Some(itemid)) = (
            timestamp(row, self.timestamp),
            field(row, Some(self.name)),
            number(row, Some(self.value)),
            field(row, Some(self.itemid)),
        ) else {
            return;
        };
        let mut labels = Labels::new();
        labels.insert("itemid".into(), itemid.to_string());
        if let Some(bomc) = field(row, self.bomc_id) {
            labels.insert("bomc_id".into(), bomc.to_string());
        }
        if let Some(cmdb) = field(row, self.cmdb_id) {
            labels.insert("cmdb_id".into(), cmdb.to_string());
        }
        out.push(MetricSample {
            timestamp: ts,
            metric_name: sanitize_metric_name(name),
            value,
            labels,
        });
    }
}

impl RowNormalizer<MetricSample> for LongMetric {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<MetricSample>) {
        let (Some(ts), Some(kpi), Some(value)) = (
            timestamp(row, self.timestamp),
            field(row, Some(self.kpi_name)),
            number(row, Some(self.value)),
        ) else {
            return;
        };
        let mut labels = Labels::new();
        if let Some(cmdb) = field(row, self.cmdb_id) {
            labels.insert("cmdb_id".into(), cmdb.to_string());
            labels.insert("service".into(), service_from_component(cmdb));
            if let Some((node, pod)) = split_node_pod(cmdb) {
                labels.insert("node".into(), node.to_string());
                labels.insert("pod".into(), pod.to_string());
            }
        }
        out.push(MetricSample {
            timestamp: ts,
            metric_name: sanitize_metric_name(kpi),
            value,
            labels,
        });
    }
}

impl RowNormalizer<MetricSample> for WideMetric {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<MetricSample>) {
        let (Some(ts), Some(entity)) = (
            timestamp(row, self.timestamp),
            field(row, Some(self.entity)),
        ) else {
            return;
        };
        for (idx, name) in &self.values {
            if let Some(value) = number(row, Some(*idx)) {
                let mut labels = Labels::new();
                labels.insert("service".into(), entity.to_string());
                out.push(MetricSample {
                    timestamp: ts,
                    metric_name: name.clone(),
                    value,
                    labels,
                });
            }
        }
    }
}
