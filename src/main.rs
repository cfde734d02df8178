//! telemetry-replay CLI
//!
//! Usage:
//!   telemetry-replay run --config replay.yaml [--task task_3] [--speed 4]
//!   telemetry-replay tasks --config replay.yaml
//!   telemetry-replay inspect --config replay.yaml [--task task_3]
//!   telemetry-replay query --config replay.yaml --kind metric --start .. --end ..
//!   telemetry-replay cleanup --config replay.yaml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use telemetry_replay::config::TelemetryKind;
use telemetry_replay::dataset::{DatasetAdapter, RecordBatches, Timestamped};
use telemetry_replay::observer::TelemetryObserver;
use telemetry_replay::session::{self, ReplayPlan};
use telemetry_replay::time_mapping::{format_utc, TimeRemapper};
use telemetry_replay::{DatasetConfig, ReplaySession};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "telemetry-replay")]
#[command(about = "Replay recorded microservice telemetry into live observability backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full replay session
    Run {
        #[arg(long, env = "REPLAY_CONFIG_PATH")]
        config: PathBuf,
        /// Task to replay (defaults to the first task in the query file)
        #[arg(long)]
        task: Option<String>,
        /// Replay speed multiplier
        #[arg(long)]
        speed: Option<f64>,
        /// Skip the namespace lock; used by the container replayer
        #[arg(long, hide = true)]
        no_lock: bool,
    },
    /// List task ids in the dataset's query file
    Tasks {
        #[arg(long, env = "REPLAY_CONFIG_PATH")]
        config: PathBuf,
    },
    /// Show the resolved window, time mapping and record counts
    Inspect {
        #[arg(long, env = "REPLAY_CONFIG_PATH")]
        config: PathBuf,
        #[arg(long)]
        task: Option<String>,
    },
    /// Read replayed telemetry back from the backends
    Query {
        #[arg(long, env = "REPLAY_CONFIG_PATH")]
        config: PathBuf,
        #[arg(long, value_parser = parse_kind)]
        kind: TelemetryKind,
        /// Range start (epoch seconds or ISO-8601, replay timeline)
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Restrict to one component (cmdb_id)
        #[arg(long)]
        component: Option<String>,
    },
    /// Tear down leftovers of a session that did not exit cleanly
    Cleanup {
        #[arg(long, env = "REPLAY_CONFIG_PATH")]
        config: PathBuf,
    },
}

fn parse_kind(s: &str) -> Result<TelemetryKind, String> {
    TelemetryKind::ALL
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| format!("expected one of trace, log, metric; got '{}'", s))
}

fn parse_time(s: &str) -> Result<f64> {
    if let Ok(ts) = s.parse::<f64>() {
        return Ok(ts);
    }
    telemetry_replay::time_mapping::parse_iso_utc(s)
        .with_context(|| format!("unparseable time '{}'", s))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path, task: Option<String>, speed: Option<f64>) -> Result<DatasetConfig> {
    DatasetConfig::load(path)
        .and_then(|c| c.with_overrides(task, speed))
        .with_context(|| format!("failed to load config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    match Cli::parse().command {
        Command::Run {
            config,
            task,
            speed,
            no_lock,
        } => run(load_config(&config, task, speed)?, no_lock).await,
        Command::Tasks { config } => tasks(&load_config(&config, None, None)?),
        Command::Inspect { config, task } => inspect(load_config(&config, task, None)?).await,
        Command::Query {
            config,
            kind,
            start,
            end,
            component,
        } => {
            let config = load_config(&config, None, None)?;
            query(&config, kind, parse_time(&start)?, parse_time(&end)?, component.as_deref()).await
        }
        Command::Cleanup { config } => {
            let config = load_config(&config, None, None)?;
            let removed = session::cleanup_namespace(&config)
                .await
                .context("cleanup failed")?;
            info!(namespace = %config.namespace, removed, "🧹 cleanup complete");
            Ok(())
        }
    }
}

async fn run(config: DatasetConfig, no_lock: bool) -> Result<()> {
    let mut session = if no_lock {
        ReplaySession::unlocked(config)
    } else {
        ReplaySession::new(config)
    }
    .context("failed to prepare replay session")?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping replay");
            stop.cancel();
        }
    });

    let report = session.run().await.context("replay session failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn tasks(config: &DatasetConfig) -> Result<()> {
    let adapter = DatasetAdapter::from_config(config)?;
    for task in adapter.query_parser()?.list_tasks()? {
        println!("{}", task);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Counts {
    total: u64,
    bulk: u64,
    stream: u64,
}

fn count<T: Timestamped>(batches: RecordBatches<T>, remapper: &TimeRemapper) -> Counts {
    let mut counts = Counts::default();
    for batch in batches {
        let Ok(batch) = batch else {
            continue;
        };
        for record in batch {
            let ts = record.timestamp();
            counts.total += 1;
            counts.bulk += u64::from(remapper.selects_for_bulk(ts));
            counts.stream += u64::from(remapper.selects_for_stream(ts));
        }
    }
    counts
}

async fn inspect(config: DatasetConfig) -> Result<()> {
    let plan = ReplayPlan::build(&config).context("failed to resolve replay plan")?;
    let query = &plan.query;
    println!("task:        {}", query.task_id);
    println!("window:      {} .. {} (UTC)", query.time_range.start_str, query.time_range.end_str);
    println!("source:      {:?}", query.metadata.window_source);
    for fault in &query.faults {
        println!("fault:       {} {} {} {}", fault.datetime, fault.level, fault.component, fault.reason);
    }
    println!("mapping:     {}", plan.remapper.summary());
    println!(
        "anchor:      {} -> {}",
        format_utc(plan.remapper.anchor_original()),
        format_utc(plan.remapper.anchor_simulation())
    );

    for kind in TelemetryKind::ALL {
        if !config.telemetry.is_enabled(kind) {
            continue;
        }
        let files = plan.adapter.files_for(kind).len();
        let adapter = plan.adapter.clone();
        let remapper = plan.remapper.clone();
        let counts = tokio::task::spawn_blocking(move || match kind {
            TelemetryKind::Trace => count(adapter.load_traces(), &remapper),
            TelemetryKind::Log => count(adapter.load_logs(), &remapper),
            TelemetryKind::Metric => count(adapter.load_metrics(), &remapper),
        })
        .await
        .context("record count task failed")?;
        println!(
            "{:<7} files={} records={} bulk={} stream={}",
            kind.as_str(),
            files,
            counts.total,
            counts.bulk,
            counts.stream
        );
    }
    Ok(())
}

async fn query(
    config: &DatasetConfig,
    kind: TelemetryKind,
    start: f64,
    end: f64,
    component: Option<&str>,
) -> Result<()> {
    let observer = TelemetryObserver::from_config(config)?;
    let rows = match kind {
        TelemetryKind::Metric => serde_json::to_value(observer.query_metrics(start, end, component).await?)?,
        TelemetryKind::Log => serde_json::to_value(observer.query_logs(start, end, component).await?)?,
        TelemetryKind::Trace => serde_json::to_value(observer.query_traces(start, end, component).await?)?,
    };
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
