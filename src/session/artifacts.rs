//! On-disk session artifacts
//!
//! Everything a session leaves in `output_dir`: the namespace lock, the
//! per-type phase-1 receipts (`<type>.csv`), the `.phase1_complete` marker
//! and the generated `replay_config.json` handed to a container replayer.

use crate::config::TelemetryKind;
use crate::error::{ReplayError, ReplayResult};
use crate::loader::LoadReport;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const PHASE1_MARKER: &str = ".phase1_complete";
pub const CONTAINER_CONFIG: &str = "replay_config.json";

pub fn receipt_path(output_dir: &Path, kind: TelemetryKind) -> PathBuf {
    output_dir.join(format!("{}.csv", kind.as_str()))
}

// ============================================================================
// Namespace lock
// ============================================================================

/// Exclusive claim on a namespace, released on drop.
#[derive(Debug)]
pub struct NamespaceLock {
    path: PathBuf,
}

impl NamespaceLock {
    pub fn path_for(output_dir: &Path, namespace: &str) -> PathBuf {
        output_dir.join(format!(".replay-{}.lock", namespace))
    }

    pub fn acquire(output_dir: &Path, namespace: &str) -> ReplayResult<Self> {
        fs::create_dir_all(output_dir)?;
        let path = Self::path_for(output_dir, namespace);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ReplayError::SessionConflict(namespace.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "namespace lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release namespace lock");
            }
        }
    }
}

// ============================================================================
// Phase-1 receipts and readiness
// ============================================================================

/// Flat receipt row; csv cannot serialize the nested report.
#[derive(Debug, Serialize)]
struct Receipt<'a> {
    kind: &'a str,
    backend: &'a str,
    scanned: u64,
    selected: u64,
    submitted: u64,
    accepted: u64,
    failed_batches: u64,
    cancelled: bool,
    elapsed_ms: u64,
}

/// Write the bulk-load receipt for one type.
pub fn write_receipt(output_dir: &Path, kind: TelemetryKind, report: &LoadReport) -> ReplayResult<()> {
    fs::create_dir_all(output_dir)?;
    let path = receipt_path(output_dir, kind);
    let receipt = Receipt {
        kind: kind.as_str(),
        backend: report.backend,
        scanned: report.scanned,
        selected: report.selected,
        submitted: report.delivery.submitted,
        accepted: report.delivery.accepted,
        failed_batches: report.delivery.failed_batches,
        cancelled: report.cancelled,
        elapsed_ms: report.elapsed_ms,
    };
    let mut writer = csv::Writer::from_path(&path)
        .map_err(|e| ReplayError::dataset(&path, e))?;
    writer
        .serialize(&receipt)
        .map_err(|e| ReplayError::dataset(&path, e))?;
    writer.flush()?;
    Ok(())
}

/// Write the phase-1 marker. The body is the completion time so a
/// half-created, empty file never reads as done.
pub fn mark_phase1_complete(output_dir: &Path) -> ReplayResult<()> {
    fs::create_dir_all(output_dir)?;
    let completed_at = format!("{}\n", chrono::Utc::now().to_rfc3339());
    fs::write(output_dir.join(PHASE1_MARKER), completed_at)?;
    Ok(())
}

/// Remove receipts, markers and the generated container config. Returns
/// how many files were deleted.
pub fn remove_artifacts(output_dir: &Path) -> ReplayResult<usize> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let generated = name.ends_with(".csv") || name == PHASE1_MARKER || name == CONTAINER_CONFIG;
        if generated && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Marker-file readiness of a replayer writing into `output_dir`.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub output_dir: PathBuf,
    pub kinds: Vec<TelemetryKind>,
    pub timeout: Duration,
    pub interval: Duration,
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

impl ReadinessCheck {
    /// Ready when every enabled type has a non-empty receipt, or the
    /// phase-1 marker is non-empty.
    pub fn is_ready(&self) -> bool {
        if file_size(&self.output_dir.join(PHASE1_MARKER)).unwrap_or(0) > 0 {
            return true;
        }
        !self.kinds.is_empty()
            && self
                .kinds
                .iter()
                .all(|k| file_size(&receipt_path(&self.output_dir, *k)).unwrap_or(0) > 0)
    }

    /// One line per expected file with its size.
    pub fn diagnostics(&self) -> String {
        let mut lines = Vec::with_capacity(self.kinds.len() + 1);
        for kind in &self.kinds {
            let path = receipt_path(&self.output_dir, *kind);
            lines.push(match file_size(&path) {
                Some(size) => format!("{}: {} bytes", path.display(), size),
                None => format!("{}: missing", path.display()),
            });
        }
        let marker = self.output_dir.join(PHASE1_MARKER);
        lines.push(match file_size(&marker) {
            Some(size) => format!("{}: {} bytes", marker.display(), size),
            None => format!("{}: missing", marker.display()),
        });
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(dir: &Path) -> ReadinessCheck {
        ReadinessCheck {
            output_dir: dir.to_path_buf(),
            kinds: vec![TelemetryKind::Metric, TelemetryKind::Log],
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NamespaceLock::acquire(dir.path(), "bench").unwrap();
        assert!(lock.path().exists());
        assert!(matches!(
            NamespaceLock::acquire(dir.path(), "bench"),
            Err(ReplayError::SessionConflict(ns)) if ns == "bench"
        ));
        assert!(NamespaceLock::acquire(dir.path(), "other").is_ok());
        drop(lock);
        assert!(NamespaceLock::acquire(dir.path(), "bench").is_ok());
    }

    #[test]
    fn test_ready_needs_every_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let check = check(dir.path());
        assert!(!check.is_ready());

        write_receipt(dir.path(), TelemetryKind::Metric, &LoadReport::default()).unwrap();
        fs::write(receipt_path(dir.path(), TelemetryKind::Log), b"").unwrap();
        assert!(!check.is_ready());
        assert!(check.diagnostics().contains("log.csv: 0 bytes"));

        write_receipt(dir.path(), TelemetryKind::Log, &LoadReport::default()).unwrap();
        assert!(check.is_ready());
    }

    #[test]
    fn test_marker_alone_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        mark_phase1_complete(dir.path()).unwrap();
        assert!(check(dir.path()).is_ready());
    }

    #[test]
    fn test_empty_marker_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let check = check(dir.path());
        fs::write(dir.path().join(PHASE1_MARKER), b"").unwrap();
        assert!(!check.is_ready());
        assert!(check.diagnostics().contains(".phase1_complete: 0 bytes"));

        mark_phase1_complete(dir.path()).unwrap();
        let body = fs::read_to_string(dir.path().join(PHASE1_MARKER)).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(body.trim()).is_ok());
        assert!(check.is_ready());
    }

    #[test]
    fn test_remove_artifacts_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write_receipt(dir.path(), TelemetryKind::Trace, &LoadReport::default()).unwrap();
        mark_phase1_complete(dir.path()).unwrap();
        fs::write(dir.path().join(CONTAINER_CONFIG), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(remove_artifacts(dir.path()).unwrap(), 3);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(remove_artifacts(&dir.path().join("absent")).unwrap(), 0);
    }
}
