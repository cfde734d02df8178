//! Backend health checks
//!
//! Each store is polled on its readiness endpoint until it answers or the
//! bound runs out. Stores serving an enabled telemetry type are mandatory;
//! the rest only produce a degraded warning.

use crate::backend::join_url;
use crate::config::{BackendConfig, TelemetryConfig, TelemetryKind};
use crate::error::{ReplayError, ReplayResult};
use crate::replay::CancelToken;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Prometheus,
    Elasticsearch,
    Jaeger,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Prometheus, Backend::Elasticsearch, Backend::Jaeger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::Elasticsearch => "elasticsearch",
            Self::Jaeger => "jaeger",
        }
    }

    /// Telemetry type this store receives.
    pub fn serves(&self) -> TelemetryKind {
        match self {
            Self::Prometheus => TelemetryKind::Metric,
            Self::Elasticsearch => TelemetryKind::Log,
            Self::Jaeger => TelemetryKind::Trace,
        }
    }

    pub fn health_url(&self, config: &BackendConfig) -> String {
        match self {
            Self::Prometheus => join_url(&config.prometheus_url, "-/ready"),
            Self::Elasticsearch => join_url(&config.elasticsearch_url, "_cluster/health"),
            Self::Jaeger => join_url(&config.jaeger_query_url, "/"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: Backend,
    pub url: String,
    pub healthy: bool,
    pub mandatory: bool,
    pub detail: String,
}

/// One probe. Elasticsearch answering `red` counts as not ready.
pub async fn probe(client: &reqwest::Client, backend: Backend, url: &str) -> Result<(), String> {
    let resp = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    if !status.is_success() {
        return Err(format!("HTTP {}", status));
    }
    if backend == Backend::Elasticsearch {
        let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        if body.get("status").and_then(|s| s.as_str()) == Some("red") {
            return Err("cluster status red".to_string());
        }
    }
    Ok(())
}

/// Poll until healthy or `timeout`. `Ok(Err(detail))` means the bound ran out.
pub async fn wait_healthy(
    client: &reqwest::Client,
    backend: Backend,
    url: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> ReplayResult<Result<(), String>> {
    let started = Instant::now();
    loop {
        let last = match probe(client, backend, url).await {
            Ok(()) => return Ok(Ok(())),
            Err(detail) => detail,
        };
        if started.elapsed() + interval > timeout {
            return Ok(Err(last));
        }
        if !cancel.sleep(interval).await {
            return Err(ReplayError::Cancelled);
        }
    }
}

/// Check every backend; fails on the first mandatory one that never came up.
pub async fn check_backends(
    client: &reqwest::Client,
    backends: &BackendConfig,
    telemetry: &TelemetryConfig,
    cancel: &CancelToken,
) -> ReplayResult<Vec<BackendHealth>> {
    let timeout = Duration::from_secs(backends.health_timeout_secs);
    let interval = Duration::from_secs(backends.health_interval_secs.max(1));
    let checks = Backend::ALL.map(|backend| {
        let url = backend.health_url(backends);
        let mandatory = telemetry.is_enabled(backend.serves());
        async move {
            // Optional stores get a single probe.
            let outcome = if mandatory {
                wait_healthy(client, backend, &url, timeout, interval, cancel).await?
            } else {
                probe(client, backend, &url).await
            };
            Ok::<_, ReplayError>(BackendHealth {
                backend,
                healthy: outcome.is_ok(),
                detail: outcome.err().unwrap_or_else(|| "ok".to_string()),
                url,
                mandatory,
            })
        }
    });
    let [a, b, c] = checks;
    let (a, b, c) = tokio::join!(a, b, c);
    let report = vec![a?, b?, c?];

    for health in &report {
        match (health.healthy, health.mandatory) {
            (true, _) => info!(backend = health.backend.as_str(), "✅ backend ready"),
            (false, false) => warn!(
                backend = health.backend.as_str(),
                detail = %health.detail,
                "backend unavailable, running degraded"
            ),
            (false, true) => {
                return Err(ReplayError::ReadinessTimeout {
                    waited: timeout,
                    diagnostics: format!(
                        "{} not ready at {}: {}",
                        health.backend.as_str(),
                        health.url,
                        health.detail
                    ),
                });
            }
        }
    }
    Ok(report)
}
