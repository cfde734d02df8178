//! Dataset adapters
//!
//! One adapter per dataset family, selected by the config's `dataset_type`
//! tag. Adding a family means adding a variant here and its normalization
//! tables in a sibling module; callers only see [`DatasetAdapter`].

pub mod batches;
pub mod openrca;
pub mod records;
pub mod stream;

pub use batches::RecordBatches;
pub use records::{BatchKey, Labels, LogEntry, MetricSample, Timestamped, TraceSpan};
pub use stream::RecordStream;

use crate::config::{DatasetConfig, DatasetFamily, TelemetryKind};
use crate::error::ReplayResult;
use crate::time_mapping::QueryParser;
use openrca::OpenRcaAdapter;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum DatasetAdapter {
    OpenRca(OpenRcaAdapter),
}

impl DatasetAdapter {
    pub fn from_config(config: &DatasetConfig) -> ReplayResult<Self> {
        match config.dataset_type {
            DatasetFamily::OpenRca => Ok(Self::OpenRca(OpenRcaAdapter::new(config)?)),
        }
    }

    pub fn family(&self) -> DatasetFamily {
        match self {
            Self::OpenRca(_) => DatasetFamily::OpenRca,
        }
    }

    /// Fresh single pass over every trace file.
    pub fn load_traces(&self) -> RecordBatches<TraceSpan> {
        match self {
            Self::OpenRca(a) => a.load_traces(),
        }
    }

    pub fn load_logs(&self) -> RecordBatches<LogEntry> {
        match self {
            Self::OpenRca(a) => a.load_logs(),
        }
    }

    pub fn load_metrics(&self) -> RecordBatches<MetricSample> {
        match self {
            Self::OpenRca(a) => a.load_metrics(),
        }
    }

    pub fn query_parser(&self) -> ReplayResult<QueryParser> {
        match self {
            Self::OpenRca(a) => Ok(QueryParser::OpenRca(a.query_parser()?)),
        }
    }

    /// Source files that `load_*` would read for `kind`.
    pub fn files_for(&self, kind: TelemetryKind) -> Vec<PathBuf> {
        match self {
            Self::OpenRca(a) => a.files_for(kind),
        }
    }
}
