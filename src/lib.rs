//! Telemetry Replay Library
//!
//! Replays recorded observability datasets (traces, logs, metrics) into live
//! Prometheus / Elasticsearch / Jaeger backends as if the recorded incident
//! were happening now.
//!
//! Data flows one direction:
//! raw files -> [`dataset`] adapter -> [`time_mapping`] remapper ->
//! [`loader`] (history) or [`replay`] (realtime tail) -> [`backend`].

pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod observer;
pub mod replay;
pub mod session;
pub mod time_mapping;

pub use config::DatasetConfig;
pub use error::{ReplayError, ReplayResult};
pub use session::{ReplaySession, SessionState};
