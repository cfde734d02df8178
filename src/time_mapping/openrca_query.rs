//! OpenRCA task query parser
//!
//! Tasks live in `query.csv` (`task_index, instruction, scoring_points`) and
//! ground-truth faults in `record.csv` (`level, component, timestamp,
//! datetime, reason`). Instructions state their window in free text, in the
//! dataset's local timezone (UTC+8 for the published dataset), e.g.
//!
//! ```text
//! On March 4, 2021, within the time range of 14:30 to 15:00, ...
//! between 2021-03-04 14:30:00 and 2021-03-04 15:00:00 ...
//! ```
//!
//! Every window and datetime handed out is converted to UTC.

use super::query::{FaultRecord, QueryMetadata, QueryResult, TimeRange, WindowSource};
use super::{format_utc, UTC_FORMAT};
use crate::error::{ReplayError, ReplayResult};
use chrono::{Duration as ChronoDuration, FixedOffset, Month, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Padding applied around fault records when the instruction has no window.
pub const FALLBACK_PADDING_SECS: f64 = 1800.0;

/// Window phrasings, tried in this order; the first that parses wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowPattern {
    /// `March 4, 2021 ... 14:30 to 15:00`
    MonthDateRange,
    /// `March 4, 2021 ... from 14:30 to 15:00`
    MonthDateFromRange,
    /// `2021-03-04 14:30:00 and|to 2021-03-04 15:00:00`
    IsoPair,
    /// `on 2021-03-04 ... from 14:30 to 15:00`
    OnIsoDateFromRange,
    /// `between 14:30 and 15:00 ... on March 4, 2021`
    BetweenOnMonthDate,
}

impl WindowPattern {
    const ORDER: [WindowPattern; 5] = [
        Self::MonthDateRange,
        Self::MonthDateFromRange,
        Self::IsoPair,
        Self::OnIsoDateFromRange,
        Self::BetweenOnMonthDate,
    ];

    fn regex(&self) -> &'static str {
        match self {
            Self::MonthDateRange => r"(?i)(\w+ \d+, \d{4}).*?(\d{1,2}:\d{2})\s+to\s+(\d{1,2}:\d{2})",
            Self::MonthDateFromRange => {
                r"(?i)(\w+ \d+, \d{4}).*?from\s+(\d{1,2}:\d{2})\s+to\s+(\d{1,2}:\d{2})"
            }
            Self::IsoPair => {
                r"(?i)(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\s+(?:and|to)\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})"
            }
            Self::OnIsoDateFromRange => {
                r"(?i)on\s+(\d{4}-\d{2}-\d{2}).*?from\s+(\d{1,2}:\d{2})\s+to\s+(\d{1,2}:\d{2})"
            }
            Self::BetweenOnMonthDate => {
                r"(?i)between\s+(\d{1,2}:\d{2})\s+and\s+(\d{1,2}:\d{2}).*?on\s+(\w+ \d+, \d{4})"
            }
        }
    }

    /// Local (source timezone) start and end of the window.
    fn extract(&self, caps: &Captures<'_>) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let group = |i: usize| caps.get(i).map(|m| m.as_str());
        match self {
            Self::MonthDateRange | Self::MonthDateFromRange => {
                let date = parse_month_date(group(1)?)?;
                same_day_range(date, group(2)?, group(3)?)
            }
            Self::IsoPair => {
                let start = parse_iso_local(group(1)?)?;
                let end = parse_iso_local(group(2)?)?;
                Some((start, end))
            }
            Self::OnIsoDateFromRange => {
                let date = NaiveDate::parse_from_str(group(1)?, "%Y-%m-%d").ok()?;
                same_day_range(date, group(2)?, group(3)?)
            }
            Self::BetweenOnMonthDate => {
                let date = parse_month_date(group(3)?)?;
                same_day_range(date, group(1)?, group(2)?)
            }
        }
    }
}

/// `March 4, 2021` (full or abbreviated month name, any case).
fn parse_month_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.split_whitespace();
    let month = Month::from_str(parts.next()?).ok()?;
    let day: u32 = parts.next()?.trim_end_matches(',').parse().ok()?;
    let year: i32 = parts.next()?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month.number_from_month(), day)
}

/// `H:MM` or `HH:MM`.
fn parse_clock(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

fn parse_iso_local(s: &str) -> Option<NaiveDateTime> {
    let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, UTC_FORMAT).ok()
}

/// Both clock times on `date`; an end before the start rolls over midnight.
fn same_day_range(date: NaiveDate, start: &str, end: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = date.and_time(parse_clock(start)?);
    let mut end = date.and_time(parse_clock(end)?);
    if end < start {
        end += ChronoDuration::days(1);
    }
    Some((start, end))
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    task_index: String,
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    scoring_points: String,
}

#[derive(Debug, Deserialize)]
struct RecordRow {
    #[serde(default)]
    level: String,
    #[serde(default)]
    component: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    timestamp: Option<f64>,
    #[serde(default)]
    datetime: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone)]
pub struct OpenRcaQueryParser {
    query_file: PathBuf,
    record_file: PathBuf,
    source_offset: FixedOffset,
    dataset_type: String,
    dataset_name: String,
    patterns: Vec<(WindowPattern, Regex)>,
    local_datetime: Regex,
}

impl OpenRcaQueryParser {
    pub fn new(
        query_file: impl Into<PathBuf>,
        record_file: impl Into<PathBuf>,
        source_utc_offset_hours: i32,
        dataset_type: &str,
        dataset_name: &str,
    ) -> ReplayResult<Self> {
        let source_offset = FixedOffset::east_opt(source_utc_offset_hours * 3600).ok_or_else(|| {
            ReplayError::config(format!(
                "query.source_utc_offset_hours out of range: {}",
                source_utc_offset_hours
            ))
        })?;

        let patterns = WindowPattern::ORDER
            .iter()
            .map(|p| {
                Regex::new(p.regex())
                    .map(|re| (*p, re))
                    .map_err(|e| ReplayError::config(format!("bad window pattern {:?}: {}", p, e)))
            })
            .collect::<ReplayResult<Vec<_>>>()?;
        let local_datetime = Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}")
            .map_err(|e| ReplayError::config(e.to_string()))?;

        Ok(Self {
            query_file: query_file.into(),
            record_file: record_file.into(),
            source_offset,
            dataset_type: dataset_type.to_string(),
            dataset_name: dataset_name.to_string(),
            patterns,
            local_datetime,
        })
    }

    pub fn list_tasks(&self) -> ReplayResult<Vec<String>> {
        Ok(self.read_queries()?.into_iter().map(|q| q.task_index).collect())
    }

    pub fn parse_task(&self, task_id: Option<&str>) -> ReplayResult<QueryResult> {
        let queries = self.read_queries()?;
        let query = match task_id {
            Some(id) => queries.into_iter().find(|q| q.task_index == id).ok_or_else(|| {
                ReplayError::config(format!(
                    "task '{}' not found in {}",
                    id,
                    self.query_file.display()
                ))
            })?,
            None => queries.into_iter().next().ok_or_else(|| {
                ReplayError::config(format!("no tasks in {}", self.query_file.display()))
            })?,
        };

        let mut records = self.read_records()?;

        let (time_range, window_source) = match self.window_from_instruction(&query.instruction) {
            Some(range) => (range, WindowSource::Instruction),
            None => {
                let range = fallback_window(&records).ok_or_else(|| {
                    ReplayError::config(format!(
                        "task '{}': no time window in instruction and no fault records to fall back on",
                        query.task_index
                    ))
                })?;
                warn!(
                    task = %query.task_index,
                    start = %range.start_str,
                    end = %range.end_str,
                    "⚠️ no time window in instruction, using fault records +/- 30min"
                );
                (range, WindowSource::RecordFallback)
            }
        };

        records.retain(|r| time_range.contains(r.timestamp));
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        debug!(task = %query.task_index, faults = records.len(), "resolved task window");

        Ok(QueryResult {
            task_id: query.task_index,
            time_range,
            faults: records,
            metadata: QueryMetadata {
                scoring_points: self.scoring_points_to_utc(&query.scoring_points),
                instruction: query.instruction,
                dataset_type: self.dataset_type.clone(),
                dataset_name: self.dataset_name.clone(),
                window_source,
            },
        })
    }

    fn window_from_instruction(&self, instruction: &str) -> Option<TimeRange> {
        self.patterns.iter().find_map(|(pattern, re)| {
            let caps = re.captures(instruction)?;
            let (start, end) = pattern.extract(&caps)?;
            debug!(?pattern, %start, %end, "instruction window matched");
            Some(TimeRange::new(self.local_to_utc(start)?, self.local_to_utc(end)?))
        })
    }

    fn local_to_utc(&self, local: NaiveDateTime) -> Option<f64> {
        self.source_offset
            .from_local_datetime(&local)
            .single()
            .map(|dt| dt.timestamp() as f64)
    }

    /// Rewrite `YYYY-MM-DD HH:MM:SS` occurrences from source-local time to UTC.
    fn scoring_points_to_utc(&self, text: &str) -> String {
        self.local_datetime
            .replace_all(text, |caps: &Captures<'_>| {
                let raw = &caps[0];
                parse_iso_local(raw)
                    .and_then(|local| self.local_to_utc(local))
                    .map(format_utc)
                    .unwrap_or_else(|| raw.to_string())
            })
            .into_owned()
    }

    fn read_queries(&self) -> ReplayResult<Vec<QueryRow>> {
        read_csv_rows(&self.query_file)
    }

    fn read_records(&self) -> ReplayResult<Vec<FaultRecord>> {
        let rows: Vec<RecordRow> = read_csv_rows(&self.record_file)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let timestamp = match row.timestamp {
                    Some(ts) => super::normalize_epoch(ts),
                    None => parse_iso_local(&row.datetime).and_then(|l| self.local_to_utc(l))?,
                };
                Some(FaultRecord {
                    timestamp,
                    datetime: format_utc(timestamp),
                    level: row.level,
                    component: row.component,
                    reason: row.reason,
                })
            })
            .collect())
    }
}

/// `[min(ts) - 30min, max(ts) + 30min]` over all fault records.
fn fallback_window(records: &[FaultRecord]) -> Option<TimeRange> {
    let min = records.iter().map(|r| r.timestamp).reduce(f64::min)?;
    let max = records.iter().map(|r| r.timestamp).reduce(f64::max)?;
    Some(TimeRange::new(min - FALLBACK_PADDING_SECS, max + FALLBACK_PADDING_SECS))
}

fn read_csv_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> ReplayResult<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| ReplayError::dataset(path, e))?;
    let mut rows = Vec::new();
    for (line, row) in reader.deserialize::<T>().enumerate() {
        match row {
            Ok(row) => rows.push(row),
            Err(e) => debug!(path = %path.display(), line = line + 2, error = %e, "skipping malformed row"),
        }
    }
    Ok(rows)
}
