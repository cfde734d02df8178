//! Task query results and the parser family selector.

use super::format_utc;
use super::openrca_query::OpenRcaQueryParser;
use crate::error::ReplayResult;
use serde::{Deserialize, Serialize};

/// Inclusive task window in UTC epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub start_str: String,
    pub end_str: String,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            duration: end - start,
            start_str: format_utc(start),
            end_str: format_utc(end),
        }
    }

    #[inline]
    pub fn contains(&self, ts: f64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// One expected fault from the dataset's ground-truth records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub timestamp: f64,
    /// UTC rendering of `timestamp`.
    pub datetime: String,
    pub level: String,
    pub component: String,
    pub reason: String,
}

/// Where the task window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    Instruction,
    /// No pattern matched; fault records +/- 30 minutes.
    RecordFallback,
    /// Query parsing disabled; window pinned to a configured anchor.
    Configured,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub instruction: String,
    /// Scoring text with source-local datetimes rewritten to UTC.
    pub scoring_points: String,
    pub dataset_type: String,
    pub dataset_name: String,
    pub window_source: WindowSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub task_id: String,
    pub time_range: TimeRange,
    /// Sorted ascending by timestamp.
    pub faults: Vec<FaultRecord>,
    pub metadata: QueryMetadata,
}

impl QueryResult {
    /// Result for a session that skips query parsing and anchors on a fixed time.
    pub fn pinned(task_id: &str, anchor: f64, dataset_type: &str, dataset_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            time_range: TimeRange::new(anchor, anchor),
            faults: Vec::new(),
            metadata: QueryMetadata {
                instruction: String::new(),
                scoring_points: String::new(),
                dataset_type: dataset_type.to_string(),
                dataset_name: dataset_name.to_string(),
                window_source: WindowSource::Configured,
            },
        }
    }

    pub fn first_fault(&self) -> Option<&FaultRecord> {
        self.faults.first()
    }
}

/// Query parser for each supported dataset family.
#[derive(Debug, Clone)]
pub enum QueryParser {
    OpenRca(OpenRcaQueryParser),
}

impl QueryParser {
    /// Resolve a task (first task when `task_id` is `None`) into its window and faults.
    pub fn parse_task(&self, task_id: Option<&str>) -> ReplayResult<QueryResult> {
        match self {
            Self::OpenRca(parser) => parser.parse_task(task_id),
        }
    }

    pub fn list_tasks(&self) -> ReplayResult<Vec<String>> {
        match self {
            Self::OpenRca(parser) => parser.list_tasks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_is_inclusive() {
        let range = TimeRange::new(100.0, 200.0);
        assert_eq!(range.duration, 100.0);
        assert!(range.contains(100.0));
        assert!(range.contains(200.0));
        assert!(!range.contains(200.5));
    }
}
