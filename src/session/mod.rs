//! Replay session lifecycle
//!
//! ```text
//! Configured -> InfraStarting -> BulkLoading -> Replaying -> Cleaning -> Stopped
//!                      \______________\______________\___________> Failed
//! ```
//!
//! A session owns one namespace for its whole life (guarded by a lock file),
//! brings the backends up, delivers the history window in bulk, streams the
//! rest at the configured pace, and tears everything down again. Failures
//! after the lock is taken always run a best-effort cleanup first.

pub mod artifacts;
pub mod container;
pub mod health;

use crate::backend::elasticsearch::{ElasticsearchBulk, LOG_BATCH_SIZE};
use crate::backend::http_client;
use crate::backend::jaeger::{JaegerCollector, TRACE_BATCH_SIZE};
use crate::backend::prometheus::{PrometheusRemoteWrite, METRIC_BATCH_SIZE};
use crate::backend::RecordSink;
use crate::config::{DatasetConfig, Execution, TelemetryKind};
use crate::dataset::{BatchKey, DatasetAdapter, RecordBatches, RecordStream, Timestamped};
use crate::error::{ReplayError, ReplayResult};
use crate::loader::{BulkLoader, LoadReport};
use crate::replay::{cancellation, CancelHandle, CancelToken, ReplayReport, Replayer, StreamOptions};
use crate::time_mapping::{format_utc, QueryResult, TimeRemapper};
use artifacts::{NamespaceLock, ReadinessCheck, CONTAINER_CONFIG};
use container::{ComposeStack, ContainerSpec, DockerContainer, ProcessProbe, ProcessStatus};
use health::BackendHealth;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Mount points inside the replayer container.
pub const CONTAINER_DATASET_DIR: &str = "/dataset";
pub const CONTAINER_OUTPUT_DIR: &str = "/replay_output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Configured,
    InfraStarting,
    BulkLoading,
    Replaying,
    Cleaning,
    Stopped,
    Failed,
}

fn debug_mode() -> bool {
    std::env::var("DEBUG_MODE").map(|v| v == "true").unwrap_or(false)
}

// ============================================================================
// Plan: dataset + task + timeline, no side effects
// ============================================================================

/// Everything derived from the config before any backend is touched.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub adapter: DatasetAdapter,
    pub query: QueryResult,
    pub remapper: TimeRemapper,
}

impl ReplayPlan {
    pub fn build(config: &DatasetConfig) -> ReplayResult<Self> {
        config.validate()?;
        let adapter = DatasetAdapter::from_config(config)?;
        let query = resolve_query(config, &adapter)?;
        let remapper = TimeRemapper::new(&config.time_mapping, &config.replay, &query)?;
        info!(
            task = %query.task_id,
            window_start = %query.time_range.start_str,
            window_end = %query.time_range.end_str,
            faults = query.faults.len(),
            "🧭 {}",
            remapper.summary()
        );
        Ok(Self {
            adapter,
            query,
            remapper,
        })
    }
}

/// Parse the task window, or pin it to `custom_anchor` when queries are off.
pub fn resolve_query(config: &DatasetConfig, adapter: &DatasetAdapter) -> ReplayResult<QueryResult> {
    if config.query.enable {
        return adapter
            .query_parser()?
            .parse_task(config.query.task_identifier.as_deref());
    }
    let anchor = config.time_mapping.custom_anchor.ok_or_else(|| {
        ReplayError::config("time_mapping.custom_anchor is required when query.enable is false")
    })?;
    Ok(QueryResult::pinned(
        config.query.task_identifier.as_deref().unwrap_or("manual"),
        anchor,
        config.dataset_type.as_str(),
        &config.dataset_name,
    ))
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone)]
struct Sinks {
    traces: Arc<JaegerCollector>,
    logs: Arc<ElasticsearchBulk>,
    metrics: Arc<PrometheusRemoteWrite>,
}

impl Sinks {
    fn new(config: &DatasetConfig, client: &reqwest::Client) -> Self {
        let backends = &config.backends;
        Self {
            traces: Arc::new(JaegerCollector::new(
                client.clone(),
                &backends.jaeger_collector_url,
                &config.namespace,
            )),
            logs: Arc::new(ElasticsearchBulk::new(
                client.clone(),
                &backends.elasticsearch_url,
                &config.namespace,
            )),
            metrics: Arc::new(PrometheusRemoteWrite::new(
                client.clone(),
                &backends.prometheus_url,
                &config.namespace,
                backends.remote_write_compression,
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub namespace: String,
    pub task_id: String,
    pub anchor_original: String,
    pub anchor_simulation: String,
    pub health: Vec<BackendHealth>,
    pub bulk: BTreeMap<TelemetryKind, LoadReport>,
    pub replay: BTreeMap<TelemetryKind, ReplayReport>,
    pub cancelled: bool,
    pub artifacts_removed: usize,
    pub state: SessionState,
}

pub struct ReplaySession {
    config: DatasetConfig,
    plan: ReplayPlan,
    sinks: Sinks,
    state: SessionState,
    cancel: CancelHandle,
    lock: Option<NamespaceLock>,
    compose: Option<ComposeStack>,
    container: Option<DockerContainer>,
    report: SessionReport,
}

impl ReplaySession {
    /// Validate, plan, and claim the namespace.
    pub fn new(config: DatasetConfig) -> ReplayResult<Self> {
        let lock = NamespaceLock::acquire(&config.infra.output_dir, &config.namespace)?;
        Self::build(config, Some(lock))
    }

    /// Session without the namespace lock, for a replayer running under a
    /// parent session that already holds it.
    pub fn unlocked(config: DatasetConfig) -> ReplayResult<Self> {
        Self::build(config, None)
    }

    fn build(config: DatasetConfig, lock: Option<NamespaceLock>) -> ReplayResult<Self> {
        let plan = ReplayPlan::build(&config)?;
        let client = http_client(&config.backends)?;
        let sinks = Sinks::new(&config, &client);
        let report = SessionReport {
            namespace: config.namespace.clone(),
            task_id: plan.query.task_id.clone(),
            anchor_original: format_utc(plan.remapper.anchor_original()),
            anchor_simulation: format_utc(plan.remapper.anchor_simulation()),
            health: Vec::new(),
            bulk: BTreeMap::new(),
            replay: BTreeMap::new(),
            cancelled: false,
            artifacts_removed: 0,
            state: SessionState::Configured,
        };
        Ok(Self {
            config,
            plan,
            sinks,
            state: SessionState::Configured,
            cancel: cancellation(),
            lock,
            compose: None,
            container: None,
            report,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn query(&self) -> &QueryResult {
        &self.plan.query
    }

    pub fn remapper(&self) -> &TimeRemapper {
        &self.plan.remapper
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Handle for stopping the session from another task (e.g. Ctrl-C).
    pub fn stop_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        info!(namespace = %self.config.namespace, "🛑 stop requested");
        self.cancel.cancel();
    }

    fn transition(&mut self, next: SessionState) {
        info!(namespace = %self.config.namespace, from = ?self.state, to = ?next, "session state");
        self.state = next;
        self.report.state = next;
    }

    fn token(&self) -> CancelToken {
        self.cancel.token()
    }

    fn enabled(&self) -> Vec<TelemetryKind> {
        TelemetryKind::ALL
            .into_iter()
            .filter(|k| self.config.telemetry.is_enabled(*k))
            .collect()
    }

    fn container_name(&self) -> String {
        format!("replayer-{}", self.config.namespace)
    }

    // ------------------------------------------------------------------------
    // InfraStarting
    // ------------------------------------------------------------------------

    pub async fn start_infra(&mut self) -> ReplayResult<()> {
        self.transition(SessionState::InfraStarting);

        if self.config.replay.execution == Execution::Container
            && DockerContainer::exists(&self.container_name()).await?
        {
            return Err(ReplayError::SessionConflict(format!(
                "{} (container {} already exists)",
                self.config.namespace,
                self.container_name()
            )));
        }

        if let Some(file) = &self.config.infra.compose_file {
            let stack = ComposeStack::new(file.clone(), &self.config.namespace);
            // Registered before `up` so a half-started stack is still torn down.
            self.compose = Some(stack.clone());
            stack.up().await?;
        }

        let client = http_client(&self.config.backends)?;
        self.report.health = health::check_backends(
            &client,
            &self.config.backends,
            &self.config.telemetry,
            &self.token(),
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // BulkLoading
    // ------------------------------------------------------------------------

    /// Deliver the bulk window for every enabled type concurrently, then
    /// write the phase-1 receipts.
    pub async fn bulk_load(&mut self) -> ReplayResult<()> {
        self.transition(SessionState::BulkLoading);
        if !self.config.time_mapping.enable_bulk_history {
            info!("bulk history disabled, skipping");
            return artifacts::mark_phase1_complete(&self.config.infra.output_dir);
        }

        let buffer = self.config.replay.buffer_batches;
        let mut set: JoinSet<(TelemetryKind, LoadReport)> = JoinSet::new();
        for kind in self.enabled() {
            let adapter = &self.plan.adapter;
            match kind {
                TelemetryKind::Trace => {
                    self.spawn_loader(&mut set, kind, self.sinks.traces.clone(), adapter.load_traces(), buffer)
                }
                TelemetryKind::Log => {
                    self.spawn_loader(&mut set, kind, self.sinks.logs.clone(), adapter.load_logs(), buffer)
                }
                TelemetryKind::Metric => {
                    self.spawn_loader(&mut set, kind, self.sinks.metrics.clone(), adapter.load_metrics(), buffer)
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((kind, report)) => {
                    self.report.cancelled |= report.cancelled;
                    artifacts::write_receipt(&self.config.infra.output_dir, kind, &report)?;
                    self.report.bulk.insert(kind, report);
                }
                Err(e) => error!(error = %e, "bulk loader task failed"),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        artifacts::mark_phase1_complete(&self.config.infra.output_dir)
    }

    fn spawn_loader<T, S>(
        &self,
        set: &mut JoinSet<(TelemetryKind, LoadReport)>,
        kind: TelemetryKind,
        sink: S,
        batches: RecordBatches<T>,
        buffer: usize,
    ) where
        T: Timestamped + BatchKey + Send + 'static,
        S: RecordSink<T> + 'static,
        RecordBatches<T>: Iterator<Item = ReplayResult<Vec<T>>> + Send + 'static,
    {
        let remapper = self.plan.remapper.clone();
        let token = self.token();
        set.spawn(async move {
            let records = RecordStream::spawn(batches, buffer);
            let report = BulkLoader::new(sink).bulk_load(records, &remapper, &token).await;
            (kind, report)
        });
    }

    // ------------------------------------------------------------------------
    // Replaying
    // ------------------------------------------------------------------------

    pub async fn replay(&mut self) -> ReplayResult<()> {
        self.transition(SessionState::Replaying);
        match self.config.replay.execution {
            Execution::InProcess => self.replay_in_process().await,
            Execution::Container => self.replay_in_container().await,
        }
    }

    async fn replay_in_process(&mut self) -> ReplayResult<()> {
        let buffer = self.config.replay.buffer_batches;
        let replay = &self.config.replay;
        let mut set: JoinSet<(TelemetryKind, ReplayReport)> = JoinSet::new();
        for kind in self.enabled() {
            let adapter = &self.plan.adapter;
            match kind {
                TelemetryKind::Trace => self.spawn_replayer(
                    &mut set,
                    kind,
                    Replayer::new(
                        self.sinks.traces.clone(),
                        StreamOptions::from_config(replay, TRACE_BATCH_SIZE),
                    ),
                    adapter.load_traces(),
                    buffer,
                ),
                TelemetryKind::Log => self.spawn_replayer(
                    &mut set,
                    kind,
                    Replayer::new(
                        self.sinks.logs.clone(),
                        StreamOptions::from_config(replay, LOG_BATCH_SIZE),
                    ),
                    adapter.load_logs(),
                    buffer,
                ),
                TelemetryKind::Metric => self.spawn_replayer(
                    &mut set,
                    kind,
                    Replayer::new(
                        self.sinks.metrics.clone(),
                        StreamOptions::from_config(replay, METRIC_BATCH_SIZE),
                    ),
                    adapter.load_metrics(),
                    buffer,
                ),
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((kind, report)) => {
                    self.report.cancelled |= report.cancelled;
                    self.report.replay.insert(kind, report);
                }
                Err(e) => error!(error = %e, "replayer task failed"),
            }
        }
        Ok(())
    }

    fn spawn_replayer<T, S>(
        &self,
        set: &mut JoinSet<(TelemetryKind, ReplayReport)>,
        kind: TelemetryKind,
        replayer: Replayer<T, S>,
        batches: RecordBatches<T>,
        buffer: usize,
    ) where
        T: Timestamped + BatchKey + Send + 'static,
        S: RecordSink<T> + 'static,
        RecordBatches<T>: Iterator<Item = ReplayResult<Vec<T>>> + Send + 'static,
    {
        let remapper = self.plan.remapper.clone();
        let speed = self.config.replay.speed_factor;
        let token = self.token();
        set.spawn(async move {
            let records = RecordStream::spawn(batches, buffer);
            let report = replayer.replay(records, &remapper, speed, &token).await;
            (kind, report)
        });
    }

    /// Config handed to the container: same task, paths rewritten to the
    /// mount points, executed in-process inside the container.
    pub fn container_config(&self) -> DatasetConfig {
        let mut child = self.config.clone();
        child.replay.execution = Execution::InProcess;
        child.dataset_path = PathBuf::from(CONTAINER_DATASET_DIR);
        child.infra.output_dir = PathBuf::from(CONTAINER_OUTPUT_DIR);
        child.infra.compose_file = None;
        child.query.task_identifier = Some(self.plan.query.task_id.clone());
        child
    }

    pub fn container_spec(&self) -> ReplayResult<ContainerSpec> {
        let dataset = std::fs::canonicalize(&self.config.dataset_path)
            .map_err(|e| ReplayError::dataset(&self.config.dataset_path, e))?;
        let output = std::fs::canonicalize(&self.config.infra.output_dir)?;
        let mut env = vec![("DEBUG_MODE".to_string(), debug_mode().to_string())];
        if let Ok(filter) = std::env::var("RUST_LOG") {
            env.push(("RUST_LOG".to_string(), filter));
        }
        Ok(ContainerSpec {
            name: self.container_name(),
            image: self.config.infra.replayer_image.clone(),
            volumes: vec![
                (dataset, CONTAINER_DATASET_DIR.to_string(), true),
                (output, CONTAINER_OUTPUT_DIR.to_string(), false),
            ],
            env,
            network: Some("host".to_string()),
            args: vec![
                "run".to_string(),
                "--config".to_string(),
                format!("{}/{}", CONTAINER_OUTPUT_DIR, CONTAINER_CONFIG),
                "--no-lock".to_string(),
            ],
        })
    }

    async fn replay_in_container(&mut self) -> ReplayResult<()> {
        let output_dir = self.config.infra.output_dir.clone();
        std::fs::create_dir_all(&output_dir)?;
        let child = serde_json::to_string_pretty(&self.container_config())
            .map_err(|e| ReplayError::config(format!("cannot encode container config: {}", e)))?;
        std::fs::write(output_dir.join(CONTAINER_CONFIG), child)?;

        let spec = self.container_spec()?;
        let container = DockerContainer::run(&spec).await?;
        self.container = Some(container.clone());

        let check = ReadinessCheck {
            output_dir,
            kinds: self.enabled(),
            timeout: Duration::from_secs(self.config.infra.readiness_timeout_secs),
            interval: Duration::from_secs(self.config.infra.readiness_interval_secs.max(1)),
        };
        container::wait_for_ready(&check, &container, &self.token()).await?;
        info!(container = %container.name(), "📡 container replayer streaming");

        wait_for_exit(&container, check.interval, &self.token()).await
    }

    // ------------------------------------------------------------------------
    // Cleaning
    // ------------------------------------------------------------------------

    /// Best-effort teardown; every step runs even if an earlier one failed.
    pub async fn cleanup(&mut self) {
        self.transition(SessionState::Cleaning);

        if let Some(container) = self.container.take() {
            if let Err(e) = container.stop_and_remove().await {
                warn!(container = %container.name(), error = %e, "failed to remove replayer container");
            }
        }
        if let Some(stack) = self.compose.take() {
            if let Err(e) = stack.down().await {
                warn!(error = %e, "compose down failed");
            }
        }

        if debug_mode() {
            warn!(output_dir = %self.config.infra.output_dir.display(), "DEBUG_MODE: keeping artifacts");
        } else {
            match artifacts::remove_artifacts(&self.config.infra.output_dir) {
                Ok(n) => self.report.artifacts_removed = n,
                Err(e) => warn!(error = %e, "failed to remove session artifacts"),
            }
        }

        self.lock = None;
        self.transition(SessionState::Stopped);
    }

    /// Full lifecycle. Cancellation ends the run normally; any other error
    /// leaves the session `Failed` after cleanup.
    pub async fn run(&mut self) -> ReplayResult<SessionReport> {
        info!(
            namespace = %self.config.namespace,
            dataset = %self.config.dataset_name,
            task = %self.plan.query.task_id,
            speed = self.config.replay.speed_factor,
            "🎬 replay session starting"
        );
        let outcome = self.run_phases().await;
        self.cleanup().await;
        match outcome {
            Ok(()) => Ok(self.report.clone()),
            Err(ReplayError::Cancelled) => {
                self.report.cancelled = true;
                Ok(self.report.clone())
            }
            Err(e) => {
                error!(namespace = %self.config.namespace, error = %e, "❌ replay session failed");
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self) -> ReplayResult<()> {
        self.start_infra().await?;
        if self.config.replay.execution == Execution::InProcess {
            self.bulk_load().await?;
        }
        self.replay().await
    }
}

/// Wait for the container to finish streaming, or for cancellation.
async fn wait_for_exit(probe: &dyn ProcessProbe, interval: Duration, cancel: &CancelToken) -> ReplayResult<()> {
    loop {
        match probe.status().await {
            ProcessStatus::Running => {}
            ProcessStatus::Exited { code: 0 } => return Ok(()),
            ProcessStatus::Exited { code } => {
                return Err(ReplayError::ProcessExited {
                    status: format!("exit code {}", code),
                    logs: probe.log_tail(container::LOG_TAIL_LINES).await,
                });
            }
            ProcessStatus::Missing => return Ok(()),
        }
        if !cancel.sleep(interval).await {
            return Err(ReplayError::Cancelled);
        }
    }
}

/// Clean up after a session that did not exit cleanly: stops the replayer
/// container, brings compose down, removes artifacts and a stale lock.
pub async fn cleanup_namespace(config: &DatasetConfig) -> ReplayResult<usize> {
    let name = format!("replayer-{}", config.namespace);
    if DockerContainer::exists(&name).await? {
        DockerContainer::named(&name).stop_and_remove().await?;
    }
    if let Some(file) = &config.infra.compose_file {
        ComposeStack::new(file.clone(), &config.namespace).down().await?;
    }
    let removed = if debug_mode() {
        0
    } else {
        artifacts::remove_artifacts(&config.infra.output_dir)?
    };
    remove_stale_lock(&config.infra.output_dir, &config.namespace)?;
    Ok(removed)
}

fn remove_stale_lock(output_dir: &Path, namespace: &str) -> ReplayResult<()> {
    match std::fs::remove_file(NamespaceLock::path_for(output_dir, namespace)) {
        Ok(()) => {
            warn!(namespace, "removed stale namespace lock");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
