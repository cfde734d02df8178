//! Dataset replay configuration
//!
//! A single document describes one dataset: where its files live, which
//! telemetry types to replay, how to anchor its timeline, and where the
//! backends are. Loaded once per process and never mutated afterwards.

use crate::error::{ReplayError, ReplayResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// =============================================================================
// VOCABULARY
// =============================================================================

/// Dataset family tag, selects the adapter and query parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetFamily {
    #[serde(rename = "openrca", alias = "OpenRCA")]
    OpenRca,
}

impl DatasetFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenRca => "openrca",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Trace,
    Log,
    Metric,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [Self::Trace, Self::Log, Self::Metric];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Log => "log",
            Self::Metric => "metric",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the replay timeline relates to the recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Shift so the anchor lands on the current wall clock.
    Realtime,
    /// Same shift as `Realtime`, anchor taken from the parsed task window.
    QueryBased,
    /// Shift so the anchor lands on `simulation_start_time`.
    Manual,
    /// No shift; load a buffer around the anchor and stream the rest.
    Windowed,
}

impl FromStr for MappingMode {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(Self::Realtime),
            "query_based" => Ok(Self::QueryBased),
            "manual" => Ok(Self::Manual),
            "windowed" => Ok(Self::Windowed),
            other => Err(ReplayError::config(format!(
                "unknown time mapping mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStrategy {
    FaultStart,
    FaultDetection,
    DataStart,
    Custom,
}

impl FromStr for AnchorStrategy {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fault_start" => Ok(Self::FaultStart),
            "fault_detection" => Ok(Self::FaultDetection),
            "data_start" => Ok(Self::DataStart),
            "custom" => Ok(Self::Custom),
            other => Err(ReplayError::config(format!(
                "unknown anchor strategy '{}'",
                other
            ))),
        }
    }
}

/// Where the realtime tail is replayed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    InProcess,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteWriteCompression {
    Snappy,
    /// Uncompressed body, sent without a Content-Encoding header.
    None,
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Per-type source file names, relative to each day folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    #[serde(default = "default_trace_files")]
    pub trace_files: Vec<String>,
    #[serde(default = "default_log_files")]
    pub log_files: Vec<String>,
    #[serde(default = "default_metric_files")]
    pub metric_files: Vec<String>,
}

fn default_trace_files() -> Vec<String> {
    vec!["trace_span.csv".to_string()]
}

fn default_log_files() -> Vec<String> {
    vec!["log_service.csv".to_string()]
}

fn default_metric_files() -> Vec<String> {
    vec![
        "metric_service.csv".to_string(),
        "metric_container.csv".to_string(),
    ]
}

impl Default for DataMapping {
    fn default() -> Self {
        Self {
            trace_files: default_trace_files(),
            log_files: default_log_files(),
            metric_files: default_metric_files(),
        }
    }
}

impl DataMapping {
    pub fn files_for(&self, kind: TelemetryKind) -> &[String] {
        match kind {
            TelemetryKind::Trace => &self.trace_files,
            TelemetryKind::Log => &self.log_files,
            TelemetryKind::Metric => &self.metric_files,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: Vec<TelemetryKind>,
}

fn default_enabled() -> Vec<TelemetryKind> {
    TelemetryKind::ALL.to_vec()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

impl TelemetryConfig {
    pub fn is_enabled(&self, kind: TelemetryKind) -> bool {
        self.enabled.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_query_file")]
    pub query_file: String,
    #[serde(default = "default_record_file")]
    pub record_file: String,
    /// Task to replay; the first task in the query file when unset.
    #[serde(default)]
    pub task_identifier: Option<String>,
    /// Offset of the timezone the instructions are written in.
    #[serde(default = "default_source_utc_offset_hours")]
    pub source_utc_offset_hours: i32,
}

fn default_true() -> bool {
    true
}

fn default_query_file() -> String {
    "query.csv".to_string()
}

fn default_record_file() -> String {
    "record.csv".to_string()
}

fn default_source_utc_offset_hours() -> i32 {
    8
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            query_file: default_query_file(),
            record_file: default_record_file(),
            task_identifier: None,
            source_utc_offset_hours: default_source_utc_offset_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeMappingConfig {
    #[serde(default = "default_mode")]
    pub mode: MappingMode,
    #[serde(default = "default_anchor_strategy")]
    pub anchor_strategy: AnchorStrategy,
    /// Extra shift added on top of the anchor alignment (seconds).
    #[serde(default)]
    pub time_offset_seconds: f64,
    #[serde(default = "default_history_duration")]
    pub history_duration_seconds: f64,
    /// ISO-8601 timestamp, required in `manual` mode.
    #[serde(default)]
    pub simulation_start_time: Option<String>,
    /// Original-timeline anchor for the `custom` strategy (epoch seconds).
    #[serde(default)]
    pub custom_anchor: Option<f64>,
    #[serde(default = "default_true")]
    pub enable_bulk_history: bool,
}

fn default_mode() -> MappingMode {
    MappingMode::Realtime
}

fn default_anchor_strategy() -> AnchorStrategy {
    AnchorStrategy::FaultStart
}

fn default_history_duration() -> f64 {
    1800.0
}

impl Default for TimeMappingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            anchor_strategy: default_anchor_strategy(),
            time_offset_seconds: 0.0,
            history_duration_seconds: default_history_duration(),
            simulation_start_time: None,
            custom_anchor: None,
            enable_bulk_history: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_buffer_minutes")]
    pub pre_buffer_minutes: f64,
    #[serde(default = "default_buffer_minutes")]
    pub post_buffer_minutes: f64,
    /// 2.0 replays twice as fast as recorded.
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,
    /// Maximum age of a buffered realtime batch before it is flushed.
    #[serde(default = "default_streaming_interval")]
    pub streaming_interval_seconds: f64,
    /// Maximum number of buffered realtime records before a flush.
    #[serde(default = "default_stream_batch_size")]
    pub stream_batch_size: usize,
    /// Rows read from disk per batch.
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
    /// Batches read ahead of the loader/replayer per telemetry type.
    #[serde(default = "default_buffer_batches")]
    pub buffer_batches: usize,
    /// First day folder to include (`YYYY_MM_DD` or `YYYY-MM-DD`).
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default = "default_execution")]
    pub execution: Execution,
}

fn default_buffer_minutes() -> f64 {
    30.0
}

fn default_speed_factor() -> f64 {
    1.0
}

fn default_streaming_interval() -> f64 {
    1.0
}

fn default_stream_batch_size() -> usize {
    100
}

fn default_chunk_rows() -> usize {
    10_000
}

fn default_buffer_batches() -> usize {
    4
}

fn default_execution() -> Execution {
    Execution::InProcess
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            pre_buffer_minutes: default_buffer_minutes(),
            post_buffer_minutes: default_buffer_minutes(),
            speed_factor: default_speed_factor(),
            streaming_interval_seconds: default_streaming_interval(),
            stream_batch_size: default_stream_batch_size(),
            chunk_rows: default_chunk_rows(),
            buffer_batches: default_buffer_batches(),
            start_date: None,
            end_date: None,
            execution: default_execution(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,
    #[serde(default = "default_elasticsearch_url")]
    pub elasticsearch_url: String,
    #[serde(default = "default_jaeger_collector_url")]
    pub jaeger_collector_url: String,
    #[serde(default = "default_jaeger_query_url")]
    pub jaeger_query_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound on waiting for backends to come up.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_compression")]
    pub remote_write_compression: RemoteWriteCompression,
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_elasticsearch_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_jaeger_collector_url() -> String {
    "http://localhost:14268".to_string()
}

fn default_jaeger_query_url() -> String {
    "http://localhost:16686".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_health_interval_secs() -> u64 {
    2
}

fn default_compression() -> RemoteWriteCompression {
    RemoteWriteCompression::Snappy
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prometheus_url: default_prometheus_url(),
            elasticsearch_url: default_elasticsearch_url(),
            jaeger_collector_url: default_jaeger_collector_url(),
            jaeger_query_url: default_jaeger_query_url(),
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            remote_write_compression: default_compression(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Compose file bringing up the backends; infra is assumed running when unset.
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    /// Directory shared with the container replayer (csv output + markers).
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_replayer_image")]
    pub replayer_image: String,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_interval_secs")]
    pub readiness_interval_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("replay_output")
}

fn default_replayer_image() -> String {
    "telemetry-replayer:latest".to_string()
}

fn default_readiness_timeout_secs() -> u64 {
    300
}

fn default_readiness_interval_secs() -> u64 {
    2
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            compose_file: None,
            output_dir: default_output_dir(),
            replayer_image: default_replayer_image(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            readiness_interval_secs: default_readiness_interval_secs(),
        }
    }
}

// =============================================================================
// DATASET CONFIG
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_name: String,
    pub dataset_type: DatasetFamily,
    pub namespace: String,
    pub dataset_path: PathBuf,
    #[serde(default)]
    pub data_mapping: DataMapping,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub time_mapping: TimeMappingConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub backends: BackendConfig,
    #[serde(default)]
    pub infra: InfraConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> ReplayResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            other => Err(ReplayError::config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

impl DatasetConfig {
    /// Load and validate a config document, format chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_str_as(&contents, format)
    }

    pub fn from_str_as(contents: &str, format: ConfigFormat) -> ReplayResult<Self> {
        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str::<Self>(contents).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(contents).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str::<Self>(contents).map_err(|e| e.to_string()),
        }
        .map_err(ReplayError::config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `REPLAY_CONFIG_PATH` or the default path.
    pub fn from_env() -> ReplayResult<Self> {
        let path = std::env::var("REPLAY_CONFIG_PATH")
            .unwrap_or_else(|_| "replay_config.yaml".to_string());
        Self::load(&path)
    }

    pub fn validate(&self) -> ReplayResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(ReplayError::config("namespace must not be empty"));
        }
        if self.telemetry.enabled.is_empty() {
            return Err(ReplayError::config("telemetry.enabled must list at least one type"));
        }
        if !(self.replay.speed_factor > 0.0 && self.replay.speed_factor.is_finite()) {
            return Err(ReplayError::config(format!(
                "replay.speed_factor must be positive, got {}",
                self.replay.speed_factor
            )));
        }
        if self.replay.chunk_rows == 0 {
            return Err(ReplayError::config("replay.chunk_rows must be positive"));
        }
        if self.dataset_path.as_os_str().is_empty() {
            return Err(ReplayError::config("dataset_path must be set"));
        }
        if self.time_mapping.mode == MappingMode::Manual
            && self.time_mapping.simulation_start_time.is_none()
        {
            return Err(ReplayError::config(
                "time_mapping.simulation_start_time is required in manual mode",
            ));
        }
        Ok(())
    }

    /// Apply per-request overrides, re-validating the result.
    pub fn with_overrides(
        mut self,
        task_identifier: Option<String>,
        speed_factor: Option<f64>,
    ) -> ReplayResult<Self> {
        if let Some(task) = task_identifier {
            self.query.task_identifier = Some(task);
        }
        if let Some(speed) = speed_factor {
            self.replay.speed_factor = speed;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn query_file_path(&self) -> PathBuf {
        self.dataset_path.join(&self.query.query_file)
    }

    pub fn record_file_path(&self) -> PathBuf {
        self.dataset_path.join(&self.query.record_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
dataset_name: market_cloudbed1
dataset_type: openrca
namespace: static-bench
dataset_path: /data/openrca/Market/cloudbed-1
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = DatasetConfig::from_str_as(MINIMAL_YAML, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.dataset_type, DatasetFamily::OpenRca);
        assert_eq!(config.telemetry.enabled.len(), 3);
        assert_eq!(config.time_mapping.mode, MappingMode::Realtime);
        assert_eq!(config.time_mapping.anchor_strategy, AnchorStrategy::FaultStart);
        assert_eq!(config.time_mapping.history_duration_seconds, 1800.0);
        assert_eq!(config.replay.chunk_rows, 10_000);
        assert_eq!(config.query.source_utc_offset_hours, 8);
        assert_eq!(
            config.query_file_path(),
            PathBuf::from("/data/openrca/Market/cloudbed-1/query.csv")
        );
    }

    #[test]
    fn test_json_document() {
        let json = r#"{
            "dataset_name": "bank",
            "dataset_type": "openrca",
            "namespace": "bank",
            "dataset_path": "/data/bank",
            "telemetry": {"enabled": ["metric", "log"]},
            "time_mapping": {"mode": "windowed", "anchor_strategy": "fault_detection"},
            "replay": {"speed_factor": 4.0}
        }"#;
        let config = DatasetConfig::from_str_as(json, ConfigFormat::Json).unwrap();
        assert!(!config.telemetry.is_enabled(TelemetryKind::Trace));
        assert_eq!(config.time_mapping.mode, MappingMode::Windowed);
        assert_eq!(config.replay.speed_factor, 4.0);
    }

    #[test]
    fn test_unknown_anchor_strategy_is_config_error() {
        let yaml = format!("{}time_mapping:\n  anchor_strategy: whenever\n", MINIMAL_YAML);
        let err = DatasetConfig::from_str_as(&yaml, ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
        assert!(AnchorStrategy::from_str("whenever").is_err());
        assert!(MappingMode::from_str("sideways").is_err());
    }

    #[test]
    fn test_manual_mode_requires_start_time() {
        let yaml = format!("{}time_mapping:\n  mode: manual\n", MINIMAL_YAML);
        assert!(matches!(
            DatasetConfig::from_str_as(&yaml, ConfigFormat::Yaml),
            Err(ReplayError::Config(_))
        ));
    }

    #[test]
    fn test_overrides_are_validated() {
        let config = DatasetConfig::from_str_as(MINIMAL_YAML, ConfigFormat::Yaml).unwrap();
        let config = config
            .with_overrides(Some("task_3".into()), Some(10.0))
            .unwrap();
        assert_eq!(config.query.task_identifier.as_deref(), Some("task_3"));
        assert!(config.with_overrides(None, Some(0.0)).is_err());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")).unwrap(), ConfigFormat::Toml);
        assert!(ConfigFormat::from_path(Path::new("a.ini")).is_err());
    }
}
