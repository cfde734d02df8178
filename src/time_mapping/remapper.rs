//! Time Remapper
//!
//! Pure time arithmetic, no I/O. Picks an anchor on the original timeline
//! and either shifts everything so the anchor lands on a simulation time, or
//! leaves timestamps untouched and carves an initial load window around the
//! anchor.
//!
//! ```text
//!  original:   ... history ... | anchor | ... realtime tail ...
//!  shifted:    remap(ts) = ts + offset, offset = anchor_sim - anchor + extra
//!  windowed:   [anchor - pre, anchor + post] bulk loaded, rest streamed
//! ```

use super::query::QueryResult;
use super::{format_utc, now_secs, parse_iso_utc};
use crate::config::{AnchorStrategy, MappingMode, ReplayConfig, TimeMappingConfig};
use crate::error::{ReplayError, ReplayResult};

/// `data_start` anchors this far before the task window.
pub const DATA_START_LEAD_SECS: f64 = 1800.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Timeline {
    Shifted {
        anchor_simulation: f64,
        offset: f64,
    },
    Windowed {
        init_start: f64,
        init_end: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeRemapper {
    mode: MappingMode,
    strategy: AnchorStrategy,
    anchor_original: f64,
    fault_duration: f64,
    history_start_original: f64,
    timeline: Timeline,
}

impl TimeRemapper {
    /// Build against the current wall clock.
    pub fn new(
        mapping: &TimeMappingConfig,
        replay: &ReplayConfig,
        query: &QueryResult,
    ) -> ReplayResult<Self> {
        Self::with_now(mapping, replay, query, now_secs())
    }

    /// Build with an explicit "now", used by realtime and query-based modes.
    pub fn with_now(
        mapping: &TimeMappingConfig,
        replay: &ReplayConfig,
        query: &QueryResult,
        now: f64,
    ) -> ReplayResult<Self> {
        let window = &query.time_range;
        let anchor_original = match mapping.anchor_strategy {
            AnchorStrategy::FaultStart => window.start,
            AnchorStrategy::FaultDetection => query
                .first_fault()
                .map(|f| f.timestamp)
                .unwrap_or(window.start),
            AnchorStrategy::DataStart => window.start - DATA_START_LEAD_SECS,
            AnchorStrategy::Custom => mapping.custom_anchor.unwrap_or(window.start),
        };

        let timeline = match mapping.mode {
            MappingMode::Realtime | MappingMode::QueryBased => Timeline::Shifted {
                anchor_simulation: now,
                offset: now - anchor_original + mapping.time_offset_seconds,
            },
            MappingMode::Manual => {
                let raw = mapping.simulation_start_time.as_deref().ok_or_else(|| {
                    ReplayError::config("manual mode requires time_mapping.simulation_start_time")
                })?;
                let anchor_simulation = parse_iso_utc(raw).ok_or_else(|| {
                    ReplayError::config(format!("unparseable simulation_start_time '{}'", raw))
                })?;
                Timeline::Shifted {
                    anchor_simulation,
                    offset: anchor_simulation - anchor_original + mapping.time_offset_seconds,
                }
            }
            MappingMode::Windowed => Timeline::Windowed {
                init_start: anchor_original - replay.pre_buffer_minutes * 60.0,
                init_end: anchor_original + replay.post_buffer_minutes * 60.0,
            },
        };

        Ok(Self {
            mode: mapping.mode,
            strategy: mapping.anchor_strategy,
            anchor_original,
            fault_duration: window.duration.max(0.0),
            history_start_original: anchor_original - mapping.history_duration_seconds,
            timeline,
        })
    }

    #[inline]
    pub fn anchor_original(&self) -> f64 {
        self.anchor_original
    }

    /// Where the anchor lands on the replay timeline.
    pub fn anchor_simulation(&self) -> f64 {
        self.remap(self.anchor_original)
    }

    #[inline]
    pub fn offset(&self) -> f64 {
        match self.timeline {
            Timeline::Shifted { offset, .. } => offset,
            Timeline::Windowed { .. } => 0.0,
        }
    }

    pub fn mode(&self) -> MappingMode {
        self.mode
    }

    pub fn history_start_original(&self) -> f64 {
        self.history_start_original
    }

    /// `(init_start, init_end)` in windowed mode.
    pub fn init_window(&self) -> Option<(f64, f64)> {
        match self.timeline {
            Timeline::Windowed {
                init_start,
                init_end,
            } => Some((init_start, init_end)),
            Timeline::Shifted { .. } => None,
        }
    }

    #[inline]
    pub fn remap(&self, ts: f64) -> f64 {
        ts + self.offset()
    }

    #[inline]
    pub fn is_history(&self, ts: f64) -> bool {
        ts < self.anchor_original
    }

    #[inline]
    pub fn is_in_fault_window(&self, ts: f64) -> bool {
        ts >= self.anchor_original && ts <= self.anchor_original + self.fault_duration
    }

    /// Records delivered by the bulk loaders: everything before the anchor,
    /// or the initial load window in windowed mode.
    pub fn selects_for_bulk(&self, ts: f64) -> bool {
        match self.timeline {
            Timeline::Shifted { .. } => self.is_history(ts),
            Timeline::Windowed {
                init_start,
                init_end,
            } => ts >= init_start && ts <= init_end,
        }
    }

    /// Records delivered by the paced replayers.
    pub fn selects_for_stream(&self, ts: f64) -> bool {
        match self.timeline {
            Timeline::Shifted { .. } => !self.is_history(ts),
            Timeline::Windowed { init_end, .. } => ts > init_end,
        }
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "mode={:?} strategy={:?} anchor={} ({}) fault_window=[{}, {}]",
            self.mode,
            self.strategy,
            format_utc(self.anchor_original),
            self.anchor_original,
            format_utc(self.anchor_original),
            format_utc(self.anchor_original + self.fault_duration),
        );
        match self.timeline {
            Timeline::Shifted {
                anchor_simulation,
                offset,
            } => out.push_str(&format!(
                " anchor_sim={} offset={:.0}s ({:.1}d) history_from={}",
                format_utc(anchor_simulation),
                offset,
                offset / 86_400.0,
                format_utc(self.history_start_original),
            )),
            Timeline::Windowed {
                init_start,
                init_end,
            } => out.push_str(&format!(
                " init=[{}, {}]",
                format_utc(init_start),
                format_utc(init_end)
            )),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_mapping::query::{FaultRecord, QueryMetadata, TimeRange, WindowSource};

    const START: f64 = 1_647_761_400.0;
    const NOW: f64 = 1_760_000_000.0;

    fn query_with_fault(fault_ts: Option<f64>) -> QueryResult {
        QueryResult {
            task_id: "task_1".into(),
            time_range: TimeRange::new(START, START + 1800.0),
            faults: fault_ts
                .into_iter()
                .map(|ts| FaultRecord {
                    timestamp: ts,
                    datetime: format_utc(ts),
                    level: "pod".into(),
                    component: "adservice-0".into(),
                    reason: "cpu".into(),
                })
                .collect(),
            metadata: QueryMetadata {
                instruction: String::new(),
                scoring_points: String::new(),
                dataset_type: "openrca".into(),
                dataset_name: "market".into(),
                window_source: WindowSource::Instruction,
            },
        }
    }

    fn mapping(mode: MappingMode, strategy: AnchorStrategy) -> TimeMappingConfig {
        TimeMappingConfig {
            mode,
            anchor_strategy: strategy,
            ..TimeMappingConfig::default()
        }
    }

    #[test]
    fn test_anchor_strategies() {
        let replay = ReplayConfig::default();
        let query = query_with_fault(Some(START + 95.0));
        let anchor = |s| {
            TimeRemapper::with_now(&mapping(MappingMode::Realtime, s), &replay, &query, NOW)
                .unwrap()
                .anchor_original()
        };
        assert_eq!(anchor(AnchorStrategy::FaultStart), START);
        assert_eq!(anchor(AnchorStrategy::FaultDetection), START + 95.0);
        assert_eq!(anchor(AnchorStrategy::DataStart), START - 1800.0);
        assert_eq!(anchor(AnchorStrategy::Custom), START);

        let no_faults = query_with_fault(None);
        let remapper = TimeRemapper::with_now(
            &mapping(MappingMode::Realtime, AnchorStrategy::FaultDetection),
            &replay,
            &no_faults,
            NOW,
        )
        .unwrap();
        assert_eq!(remapper.anchor_original(), START);
    }

    #[test]
    fn test_shift_preserves_intervals() {
        let mut config = mapping(MappingMode::Realtime, AnchorStrategy::FaultStart);
        config.time_offset_seconds = 0.0;
        let remapper =
            TimeRemapper::with_now(&config, &ReplayConfig::default(), &query_with_fault(None), NOW)
                .unwrap();

        assert_eq!(remapper.remap(remapper.anchor_original()), NOW);
        for (a, b) in [(START - 600.0, START + 30.0), (START, START + 0.25), (1.0, 2.0)] {
            assert!((remapper.remap(b) - remapper.remap(a) - (b - a)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_extra_offset_applied() {
        let mut config = mapping(MappingMode::QueryBased, AnchorStrategy::FaultStart);
        config.time_offset_seconds = 60.0;
        let remapper =
            TimeRemapper::with_now(&config, &ReplayConfig::default(), &query_with_fault(None), NOW)
                .unwrap();
        assert_eq!(remapper.offset(), NOW - START + 60.0);
    }

    #[test]
    fn test_manual_mode_uses_simulation_start() {
        let mut config = mapping(MappingMode::Manual, AnchorStrategy::FaultStart);
        config.simulation_start_time = Some("2025-01-01T00:00:00Z".into());
        let remapper =
            TimeRemapper::with_now(&config, &ReplayConfig::default(), &query_with_fault(None), NOW)
                .unwrap();
        assert_eq!(remapper.anchor_simulation(), 1_735_689_600.0);

        config.simulation_start_time = None;
        assert!(matches!(
            TimeRemapper::with_now(&config, &ReplayConfig::default(), &query_with_fault(None), NOW),
            Err(ReplayError::Config(_))
        ));
    }

    #[test]
    fn test_windowed_bounds_are_exact() {
        let replay = ReplayConfig {
            pre_buffer_minutes: 20.0,
            post_buffer_minutes: 5.0,
            ..ReplayConfig::default()
        };
        let remapper = TimeRemapper::with_now(
            &mapping(MappingMode::Windowed, AnchorStrategy::FaultStart),
            &replay,
            &query_with_fault(None),
            NOW,
        )
        .unwrap();

        assert_eq!(remapper.init_window(), Some((START - 1200.0, START + 300.0)));
        assert_eq!(remapper.remap(START + 10.0), START + 10.0);
        assert!(remapper.selects_for_bulk(START + 300.0));
        assert!(!remapper.selects_for_bulk(START - 1201.0));
        assert!(remapper.selects_for_stream(START + 300.5));
        assert!(!remapper.selects_for_stream(START + 300.0));
    }

    #[test]
    fn test_history_classification_independent_of_mode() {
        let query = query_with_fault(Some(START + 10.0));
        let replay = ReplayConfig::default();
        for mode in [MappingMode::Realtime, MappingMode::QueryBased, MappingMode::Windowed] {
            let remapper = TimeRemapper::with_now(
                &mapping(mode, AnchorStrategy::FaultDetection),
                &replay,
                &query,
                NOW,
            )
            .unwrap();
            let anchor = remapper.anchor_original();
            for ts in [anchor - 3600.0, anchor - 0.001, anchor, anchor + 0.001, anchor + 7200.0] {
                assert_eq!(remapper.is_history(ts), ts < anchor);
            }
        }
    }

    #[test]
    fn test_fault_window_inclusive() {
        let remapper = TimeRemapper::with_now(
            &mapping(MappingMode::Realtime, AnchorStrategy::FaultStart),
            &ReplayConfig::default(),
            &query_with_fault(None),
            NOW,
        )
        .unwrap();
        assert!(remapper.selects_for_bulk(START - 1800.0));
        assert!(!remapper.selects_for_bulk(START));
        assert!(remapper.is_in_fault_window(START));
        assert!(remapper.is_in_fault_window(START + 1800.0));
        assert!(!remapper.is_in_fault_window(START + 1800.1));
        assert!(!remapper.is_in_fault_window(START - 1.0));
        assert!(remapper.summary().contains("offset="));
    }
}
