//! Backend delivery against mock HTTP stores
//!
//! Each test serves a tiny axum app on an ephemeral port standing in for
//! Prometheus, Elasticsearch or the Jaeger collector, then drives a bulk
//! loader through the real sink.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use prost::Message;
use std::sync::{Arc, Mutex};
use telemetry_replay::backend::elasticsearch::ElasticsearchBulk;
use telemetry_replay::backend::jaeger::JaegerCollector;
use telemetry_replay::backend::prometheus::PrometheusRemoteWrite;
use telemetry_replay::backend::remote_write::{TimeSeries, WriteRequest};
use telemetry_replay::backend::http_client;
use telemetry_replay::config::{BackendConfig, RemoteWriteCompression, ReplayConfig, TimeMappingConfig};
use telemetry_replay::dataset::{Labels, LogEntry, MetricSample, RecordStream, TraceSpan};
use telemetry_replay::loader::BulkLoader;
use telemetry_replay::replay::CancelToken;
use telemetry_replay::time_mapping::{QueryResult, TimeRemapper};

const ANCHOR: f64 = 1_647_761_400.0;
const NOW: f64 = 1_760_000_000.0;

// Reference protobuf definitions for the remote-write wire format.
#[derive(Clone, PartialEq, Message)]
struct WriteRequestPb {
    #[prost(message, repeated, tag = "1")]
    timeseries: Vec<TimeSeriesPb>,
}

#[derive(Clone, PartialEq, Message)]
struct TimeSeriesPb {
    #[prost(message, repeated, tag = "1")]
    labels: Vec<LabelPb>,
    #[prost(message, repeated, tag = "2")]
    samples: Vec<SamplePb>,
}

#[derive(Clone, PartialEq, Message)]
struct LabelPb {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, tag = "2")]
    value: String,
}

#[derive(Clone, PartialEq, Message)]
struct SamplePb {
    #[prost(double, tag = "1")]
    value: f64,
    #[prost(int64, tag = "2")]
    timestamp: i64,
}

impl TimeSeriesPb {
    fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn remapper() -> TimeRemapper {
    let query = QueryResult::pinned("task_1", ANCHOR, "openrca", "market");
    TimeRemapper::with_now(&TimeMappingConfig::default(), &ReplayConfig::default(), &query, NOW)
        .unwrap()
}

fn client() -> reqwest::Client {
    http_client(&BackendConfig::default()).unwrap()
}

// ============================================================================
// Prometheus remote write
// ============================================================================

#[test]
fn test_write_request_decodes_with_reference_protobuf() {
    let mut labels = Labels::new();
    labels.insert("__name__".into(), "cpu".into());
    labels.insert("pod".into(), "a-0".into());
    let mut series = TimeSeries::new(labels);
    series.push(1000, 42.5);
    let request = WriteRequest {
        timeseries: vec![series],
    };

    let decoded = WriteRequestPb::decode(request.encode().as_slice()).unwrap();
    assert_eq!(decoded.timeseries.len(), 1);
    let ts = &decoded.timeseries[0];
    assert_eq!(ts.label("__name__"), Some("cpu"));
    assert_eq!(ts.label("pod"), Some("a-0"));
    assert_eq!(ts.samples, vec![SamplePb { value: 42.5, timestamp: 1000 }]);

    let snappy = request.encode_snappy().unwrap();
    let raw = snap::raw::Decoder::new().decompress_vec(&snappy).unwrap();
    assert_eq!(raw, request.encode());
}

#[derive(Clone, Default)]
struct WriteCapture {
    requests: Arc<Mutex<Vec<WriteRequestPb>>>,
    encodings: Arc<Mutex<Vec<Option<String>>>>,
}

async fn remote_write(State(state): State<WriteCapture>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let encoding = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw = match encoding.as_deref() {
        Some("snappy") => snap::raw::Decoder::new().decompress_vec(&body).unwrap(),
        _ => body.to_vec(),
    };
    let request = WriteRequestPb::decode(raw.as_slice()).unwrap();
    let rejected = request
        .timeseries
        .iter()
        .any(|ts| ts.label("__name__") == Some("bad"));
    state.requests.lock().unwrap().push(request);
    state.encodings.lock().unwrap().push(encoding);
    if rejected {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::NO_CONTENT
    }
}

fn metric(name: &str, ts: f64, value: f64) -> MetricSample {
    let mut labels = Labels::new();
    labels.insert("cmdb_id".into(), "frontend-0".into());
    MetricSample {
        timestamp: ts,
        metric_name: name.into(),
        value,
        labels,
    }
}

#[tokio::test]
async fn test_remote_write_skips_rejected_batch() {
    let capture = WriteCapture::default();
    let app = Router::new()
        .route("/api/v1/write", post(remote_write))
        .with_state(capture.clone());
    let url = serve(app).await;

    let sink = Arc::new(PrometheusRemoteWrite::new(
        client(),
        &url,
        "bench",
        RemoteWriteCompression::Snappy,
    ));
    let loader = BulkLoader::new(sink);
    let records = RecordStream::from_batches(vec![
        vec![metric("cpu", ANCHOR - 600.0, 0.5), metric("bad", ANCHOR - 600.0, 1.0)],
        vec![metric("cpu", ANCHOR - 540.0, 0.7), metric("mem", ANCHOR - 540.0, 512.0)],
        // Realtime tail, not part of the bulk load.
        vec![metric("cpu", ANCHOR + 60.0, 0.9)],
    ]);

    let report = loader
        .bulk_load(records, &remapper(), &CancelToken::never())
        .await;

    assert_eq!(report.scanned, 5);
    assert_eq!(report.selected, 4);
    assert_eq!(report.delivery.batches, 3);
    assert_eq!(report.delivery.failed_batches, 1);
    assert_eq!(report.delivery.submitted, 4);
    assert_eq!(report.loaded(), 3);
    assert!(!report.cancelled);

    let requests = capture.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert!(capture
        .encodings
        .lock()
        .unwrap()
        .iter()
        .all(|e| e.as_deref() == Some("snappy")));

    let cpu = requests
        .iter()
        .flat_map(|r| r.timeseries.iter())
        .find(|ts| ts.label("__name__") == Some("cpu"))
        .unwrap();
    assert_eq!(cpu.label("namespace"), Some("bench"));
    assert_eq!(cpu.label("is_history"), Some("true"));
    assert_eq!(cpu.label("cmdb_id"), Some("frontend-0"));
    let stamps: Vec<i64> = cpu.samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(
        stamps,
        vec![((NOW - 600.0) * 1000.0) as i64, ((NOW - 540.0) * 1000.0) as i64]
    );
}

#[tokio::test]
async fn test_remote_write_uncompressed_omits_encoding() {
    let capture = WriteCapture::default();
    let app = Router::new()
        .route("/api/v1/write", post(remote_write))
        .with_state(capture.clone());
    let url = serve(app).await;

    let sink = Arc::new(PrometheusRemoteWrite::new(
        client(),
        &url,
        "bench",
        RemoteWriteCompression::None,
    ));
    let report = BulkLoader::new(sink)
        .bulk_load(
            RecordStream::from_batches(vec![vec![metric("cpu", ANCHOR - 60.0, 1.0)]]),
            &remapper(),
            &CancelToken::never(),
        )
        .await;

    assert_eq!(report.loaded(), 1);
    assert_eq!(*capture.encodings.lock().unwrap(), vec![None]);
}

// ============================================================================
// Elasticsearch _bulk
// ============================================================================

async fn es_bulk(State(lines): State<Arc<Mutex<Vec<String>>>>, body: String) -> Json<serde_json::Value> {
    let mut items = Vec::new();
    let mut errors = false;
    for pair in body.lines().collect::<Vec<_>>().chunks(2) {
        let doc: serde_json::Value = serde_json::from_str(pair[1]).unwrap();
        let rejected = doc["message"].as_str().unwrap_or_default().contains("reject");
        errors |= rejected;
        items.push(if rejected {
            serde_json::json!({"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}})
        } else {
            serde_json::json!({"index": {"status": 201}})
        });
    }
    lines.lock().unwrap().extend(body.lines().map(str::to_string));
    Json(serde_json::json!({"took": 3, "errors": errors, "items": items}))
}

fn log(message: &str, ts: f64) -> LogEntry {
    LogEntry {
        timestamp: ts,
        log_id: format!("id-{}", ts),
        cmdb_id: "cartservice-1".into(),
        level: "info".into(),
        message: message.into(),
        tags: Labels::new(),
    }
}

#[tokio::test]
async fn test_elasticsearch_counts_accepted_items() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/_bulk", post(es_bulk))
        .with_state(lines.clone());
    let url = serve(app).await;

    let sink = Arc::new(ElasticsearchBulk::new(client(), &url, "bench"));
    let records = RecordStream::from_batches(vec![vec![
        log("cart updated", ANCHOR - 300.0),
        log("please reject me", ANCHOR - 200.0),
        log("cart emptied", ANCHOR - 100.0),
    ]]);
    let report = BulkLoader::new(sink)
        .bulk_load(records, &remapper(), &CancelToken::never())
        .await;

    assert_eq!(report.delivery.submitted, 3);
    assert_eq!(report.delivery.failed_batches, 0);
    assert_eq!(report.loaded(), 2);

    let lines = lines.lock().unwrap().clone();
    assert_eq!(lines.len(), 6);
    let action: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(action["index"]["_index"], "logstash-bench-2025.10.09");
    let doc: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(doc["namespace"], "bench");
    assert_eq!(doc["is_history"], true);
    assert_eq!(doc["cmdb_id"], "cartservice-1");
}

// ============================================================================
// Jaeger collector
// ============================================================================

async fn jaeger_traces(
    State(batches): State<Arc<Mutex<Vec<serde_json::Value>>>>,
    Json(batch): Json<serde_json::Value>,
) -> StatusCode {
    batches.lock().unwrap().push(batch);
    StatusCode::ACCEPTED
}

fn span(service: &str, span_id: &str, parent: Option<&str>, ts: f64) -> TraceSpan {
    TraceSpan {
        timestamp: ts,
        trace_id: "trace-1".into(),
        span_id: span_id.into(),
        parent_span_id: parent.map(str::to_string),
        service: service.into(),
        operation_name: "GetCart".into(),
        duration_ms: 12.0,
        tags: Labels::new(),
    }
}

#[tokio::test]
async fn test_jaeger_posts_one_batch_per_service() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/api/traces", post(jaeger_traces))
        .with_state(batches.clone());
    let url = serve(app).await;

    let sink = Arc::new(JaegerCollector::new(client(), &url, "bench"));
    let records = RecordStream::from_batches(vec![vec![
        span("frontend", "a", None, ANCHOR - 30.0),
        span("cartservice", "b", Some("a"), ANCHOR - 29.0),
        span("cartservice", "c", Some("a"), ANCHOR - 28.0),
    ]]);
    let report = BulkLoader::new(sink)
        .bulk_load(records, &remapper(), &CancelToken::never())
        .await;

    assert_eq!(report.loaded(), 3);
    assert_eq!(report.delivery.failed_batches, 0);

    let batches = batches.lock().unwrap().clone();
    let services: Vec<&str> = batches
        .iter()
        .map(|b| b["process"]["serviceName"].as_str().unwrap())
        .collect();
    assert_eq!(services, vec!["cartservice", "frontend"]);
    assert_eq!(batches[0]["spans"].as_array().unwrap().len(), 2);
    assert_eq!(batches[0]["process"]["tags"][0]["value"], "bench");
    let start = batches[1]["spans"][0]["startTime"].as_i64().unwrap();
    assert_eq!(start, ((NOW - 30.0) * 1_000_000.0) as i64);
}
