//! Docker plumbing
//!
//! Thin wrappers over the `docker` CLI run through `tokio::process`:
//! the compose stack holding the backends, the out-of-process replayer
//! container, and the readiness poll that watches it.

use super::artifacts::ReadinessCheck;
use crate::error::{ReplayError, ReplayResult};
use crate::replay::CancelToken;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lines of container output attached to failures.
pub const LOG_TAIL_LINES: usize = 100;

async fn docker(args: &[String]) -> ReplayResult<Output> {
    debug!(args = ?args, "docker");
    Ok(Command::new("docker").args(args).output().await?)
}

/// Non-zero exit becomes `ProcessExited` carrying stderr.
fn require_success(what: &str, output: Output) -> ReplayResult<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    Err(ReplayError::ProcessExited {
        status: format!("{} ({})", what, output.status),
        logs: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Compose stack
// ============================================================================

#[derive(Debug, Clone)]
pub struct ComposeStack {
    pub file: PathBuf,
    pub project: String,
}

impl ComposeStack {
    pub fn new(file: PathBuf, project: &str) -> Self {
        Self {
            file,
            project: project.to_string(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "compose".into(),
            "-f".into(),
            self.file.display().to_string(),
            "-p".into(),
            self.project.clone(),
        ]
    }

    pub fn up_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(strings(["up", "-d"]));
        args
    }

    /// Images are kept so the next session starts fast.
    pub fn down_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("down".into());
        args
    }

    pub async fn up(&self) -> ReplayResult<()> {
        info!(file = %self.file.display(), project = %self.project, "🐳 starting compose stack");
        require_success("docker compose up", docker(&self.up_args()).await?)?;
        Ok(())
    }

    pub async fn down(&self) -> ReplayResult<()> {
        require_success("docker compose down", docker(&self.down_args()).await?)?;
        info!(project = %self.project, "compose stack stopped");
        Ok(())
    }
}

// ============================================================================
// Replayer container
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited { code: i64 },
    Missing,
}

/// Liveness and output of an out-of-process replayer.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn status(&self) -> ProcessStatus;

    async fn log_tail(&self, lines: usize) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `(host path, container path, read_only)`
    pub volumes: Vec<(PathBuf, String, bool)>,
    pub env: Vec<(String, String)>,
    pub network: Option<String>,
    pub args: Vec<String>,
}

impl ContainerSpec {
    pub fn run_args(&self) -> Vec<String> {
        let mut args = strings(["run", "-d", "--name"]);
        args.push(self.name.clone());
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for (host, target, read_only) in &self.volumes {
            args.push("-v".into());
            let mode = if *read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", host.display(), target, mode));
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

#[derive(Debug, Clone)]
pub struct DockerContainer {
    name: String,
}

impl DockerContainer {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a container (running or not) already uses `name`.
    pub async fn exists(name: &str) -> ReplayResult<bool> {
        let args = vec![
            "ps".into(),
            "-a".into(),
            "--filter".into(),
            format!("name=^/{}$", name),
            "--format".into(),
            "{{.Names}}".into(),
        ];
        let listed = require_success("docker ps", docker(&args).await?)?;
        Ok(listed.lines().any(|l| l.trim() == name))
    }

    pub async fn run(spec: &ContainerSpec) -> ReplayResult<Self> {
        let id = require_success("docker run", docker(&spec.run_args()).await?)?;
        info!(
            name = %spec.name,
            image = %spec.image,
            id = %id.chars().take(12).collect::<String>(),
            "🚀 replayer container started"
        );
        Ok(Self::named(&spec.name))
    }

    pub async fn stop_and_remove(&self) -> ReplayResult<()> {
        let stop = docker(&[
            "stop".into(),
            "-t".into(),
            "10".into(),
            self.name.clone(),
        ])
        .await?;
        if !stop.status.success() {
            debug!(name = %self.name, "docker stop failed, forcing removal");
        }
        require_success("docker rm", docker(&["rm".into(), "-f".into(), self.name.clone()]).await?)?;
        info!(name = %self.name, "replayer container removed");
        Ok(())
    }
}

/// `docker inspect` output `"<status> <exit code>"`.
pub fn parse_inspect(line: &str) -> ProcessStatus {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next().and_then(|c| c.parse::<i64>().ok())) {
        (Some("running" | "created" | "restarting"), _) => ProcessStatus::Running,
        (Some("exited" | "dead"), code) => ProcessStatus::Exited {
            code: code.unwrap_or(-1),
        },
        (Some(_), _) => ProcessStatus::Running,
        (None, _) => ProcessStatus::Missing,
    }
}

#[async_trait]
impl ProcessProbe for DockerContainer {
    async fn status(&self) -> ProcessStatus {
        let args = vec![
            "inspect".into(),
            "-f".into(),
            "{{.State.Status}} {{.State.ExitCode}}".into(),
            self.name.clone(),
        ];
        match docker(&args).await {
            Ok(out) if out.status.success() => parse_inspect(&String::from_utf8_lossy(&out.stdout)),
            Ok(_) => ProcessStatus::Missing,
            Err(e) => {
                warn!(name = %self.name, error = %e, "docker inspect failed");
                ProcessStatus::Missing
            }
        }
    }

    async fn log_tail(&self, lines: usize) -> String {
        let args = vec![
            "logs".into(),
            "--tail".into(),
            lines.to_string(),
            self.name.clone(),
        ];
        match docker(&args).await {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                text
            }
            Err(e) => format!("<logs unavailable: {}>", e),
        }
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Poll `check` until ready. Fails early if the process exits, with
/// diagnostics on timeout, or with `Cancelled`.
pub async fn wait_for_ready(
    check: &ReadinessCheck,
    probe: &dyn ProcessProbe,
    cancel: &CancelToken,
) -> ReplayResult<Duration> {
    let started = Instant::now();
    loop {
        if check.is_ready() {
            let waited = started.elapsed();
            info!(waited_s = waited.as_secs(), "replayer ready");
            return Ok(waited);
        }
        match probe.status().await {
            ProcessStatus::Running => {}
            ProcessStatus::Exited { code } => {
                return Err(ReplayError::ProcessExited {
                    status: format!("exit code {}", code),
                    logs: probe.log_tail(LOG_TAIL_LINES).await,
                });
            }
            ProcessStatus::Missing => {
                return Err(ReplayError::ProcessExited {
                    status: "container not found".to_string(),
                    logs: String::new(),
                });
            }
        }
        let waited = started.elapsed();
        if waited >= check.timeout {
            let diagnostics = format!(
                "{}\ncontainer status: {:?}\n--- last {} log lines ---\n{}",
                check.diagnostics(),
                probe.status().await,
                LOG_TAIL_LINES,
                probe.log_tail(LOG_TAIL_LINES).await
            );
            return Err(ReplayError::ReadinessTimeout {
                waited,
                diagnostics,
            });
        }
        if !cancel.sleep(check.interval).await {
            return Err(ReplayError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryKind;
    use crate::replay::cancellation;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs for `polls_until_exit` status checks, then exits with code 3.
    struct FakeProcess {
        polls: AtomicUsize,
        polls_until_exit: usize,
    }

    impl FakeProcess {
        fn new(polls_until_exit: usize) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                polls_until_exit,
            }
        }
    }

    #[async_trait]
    impl ProcessProbe for FakeProcess {
        async fn status(&self) -> ProcessStatus {
            if self.polls.fetch_add(1, Ordering::SeqCst) >= self.polls_until_exit {
                ProcessStatus::Exited { code: 3 }
            } else {
                ProcessStatus::Running
            }
        }

        async fn log_tail(&self, _lines: usize) -> String {
            "panic: dataset not mounted".to_string()
        }
    }

    fn check(dir: &Path, timeout_secs: u64) -> ReadinessCheck {
        ReadinessCheck {
            output_dir: dir.to_path_buf(),
            kinds: vec![TelemetryKind::Metric],
            timeout: Duration::from_secs(timeout_secs),
            interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_compose_args_never_remove_images() {
        let stack = ComposeStack::new(PathBuf::from("infra/compose.yml"), "bench");
        assert_eq!(
            stack.up_args(),
            strings(["compose", "-f", "infra/compose.yml", "-p", "bench", "up", "-d"])
        );
        assert!(!stack.down_args().iter().any(|a| a == "--rmi"));
        assert_eq!(stack.down_args().last().map(String::as_str), Some("down"));
    }

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec {
            name: "replayer-bench".into(),
            image: "telemetry-replayer:latest".into(),
            volumes: vec![(PathBuf::from("/data/market"), "/dataset".into(), true)],
            env: vec![("RUST_LOG".into(), "info".into())],
            network: Some("host".into()),
            args: strings(["run", "--config", "/replay_output/replay_config.json"]),
        };
        assert_eq!(
            spec.run_args(),
            strings([
                "run",
                "-d",
                "--name",
                "replayer-bench",
                "--network",
                "host",
                "-v",
                "/data/market:/dataset:ro",
                "-e",
                "RUST_LOG=info",
                "telemetry-replayer:latest",
                "run",
                "--config",
                "/replay_output/replay_config.json",
            ])
        );
    }

    #[test]
    fn test_parse_inspect() {
        assert_eq!(parse_inspect("running 0\n"), ProcessStatus::Running);
        assert_eq!(parse_inspect("exited 137"), ProcessStatus::Exited { code: 137 });
        assert_eq!(parse_inspect(""), ProcessStatus::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_when_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let check = check(dir.path(), 300);
        let marker_dir = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            crate::session::artifacts::mark_phase1_complete(&marker_dir).unwrap();
        });
        let waited = wait_for_ready(&check, &FakeProcess::new(usize::MAX), &CancelToken::never())
            .await
            .unwrap();
        assert!(waited >= Duration::from_secs(5) && waited <= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_reports_logs() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_ready(&check(dir.path(), 300), &FakeProcess::new(2), &CancelToken::never())
            .await
            .unwrap_err();
        match err {
            ReplayError::ProcessExited { status, logs } => {
                assert_eq!(status, "exit code 3");
                assert!(logs.contains("dataset not mounted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_ready(&check(dir.path(), 10), &FakeProcess::new(usize::MAX), &CancelToken::never())
            .await
            .unwrap_err();
        match err {
            ReplayError::ReadinessTimeout { waited, diagnostics } => {
                assert!(waited >= Duration::from_secs(10));
                assert!(diagnostics.contains("metric.csv: missing"));
                assert!(diagnostics.contains("dataset not mounted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let handle = cancellation();
        handle.cancel();
        let err = wait_for_ready(&check(dir.path(), 300), &FakeProcess::new(usize::MAX), &handle.token())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
    }
}
