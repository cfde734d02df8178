//! Lazy, chunked CSV reading
//!
//! A [`RecordBatches`] walks a fixed list of files, opening each one only
//! when the previous is exhausted, and yields at most `chunk_rows` source
//! rows worth of records per batch. It is finite and single-pass; calling
//! the adapter's `load_*` again builds a fresh one that re-reads from disk.

use crate::error::{ReplayError, ReplayResult};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Turns one CSV row into zero or more records.
pub trait RowNormalizer<T>: Send {
    fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<T>);
}

/// Builds the normalizer for one file from its path and header row.
pub type NormalizerFactory<T> =
    fn(&Path, &csv::StringRecord) -> ReplayResult<Box<dyn RowNormalizer<T>>>;

struct OpenFile<T> {
    path: PathBuf,
    reader: csv::Reader<File>,
    normalizer: Box<dyn RowNormalizer<T>>,
    rows_read: u64,
}

pub struct RecordBatches<T> {
    pending: VecDeque<PathBuf>,
    chunk_rows: usize,
    factory: NormalizerFactory<T>,
    current: Option<OpenFile<T>>,
    row: csv::StringRecord,
}

impl<T> RecordBatches<T> {
    pub fn new(files: Vec<PathBuf>, chunk_rows: usize, factory: NormalizerFactory<T>) -> Self {
        Self {
            pending: files.into(),
            chunk_rows: chunk_rows.max(1),
            factory,
            current: None,
            row: csv::StringRecord::new(),
        }
    }

    fn open(&self, path: PathBuf) -> ReplayResult<OpenFile<T>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .map_err(|e| ReplayError::dataset(&path, e))?;
        let headers = reader
            .headers()
            .map_err(|e| ReplayError::dataset(&path, e))?
            .clone();
        let normalizer = (self.factory)(&path, &headers)?;
        debug!(path = %path.display(), columns = headers.len(), "opened dataset file");
        Ok(OpenFile {
            path,
            reader,
            normalizer,
            rows_read: 0,
        })
    }
}

impl<T> Iterator for RecordBatches<T> {
    type Item = ReplayResult<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.pending.pop_front()?;
                match self.open(path) {
                    Ok(file) => self.current = Some(file),
                    Err(e) => return Some(Err(e)),
                }
            }
            let file = self.current.as_mut()?;

            let mut batch = Vec::new();
            let mut rows = 0;
            let mut exhausted = false;
            while rows < self.chunk_rows {
                match file.reader.read_record(&mut self.row) {
                    Ok(true) => {
                        rows += 1;
                        file.normalizer.normalize(&self.row, &mut batch);
                    }
                    Ok(false) => {
                        exhausted = true;
                        break;
                    }
                    Err(e) if e.is_io_error() => {
                        let path = file.path.clone();
                        self.current = None;
                        return Some(Err(ReplayError::dataset(path, e)));
                    }
                    Err(e) => {
                        rows += 1;
                        debug!(path = %file.path.display(), error = %e, "skipping undecodable row");
                    }
                }
            }
            file.rows_read += rows as u64;

            if exhausted {
                if file.rows_read == 0 {
                    warn!(path = %file.path.display(), "dataset file has no rows");
                }
                self.current = None;
            }
            if !batch.is_empty() {
                return Some(Ok(batch));
            }
        }
    }
}

/// Position of the first header matching any candidate name.
pub fn column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
}

/// Trimmed field, `None` when missing or empty.
pub fn field<'r>(row: &'r csv::StringRecord, idx: Option<usize>) -> Option<&'r str> {
    idx.and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn number(row: &csv::StringRecord, idx: Option<usize>) -> Option<f64> {
    field(row, idx).and_then(|s| s.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct FirstColumn;

    impl RowNormalizer<String> for FirstColumn {
        fn normalize(&self, row: &csv::StringRecord, out: &mut Vec<String>) {
            if let Some(v) = field(row, Some(0)) {
                out.push(v.to_string());
            }
        }
    }

    fn first_column(_: &Path, _: &csv::StringRecord) -> ReplayResult<Box<dyn RowNormalizer<String>>> {
        Ok(Box::new(FirstColumn))
    }

    #[test]
    fn test_chunks_preserve_file_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        fs::write(&a, "v\n1\n2\n3\n").unwrap();
        fs::write(&b, "v\n4\n5\n").unwrap();

        let batches: Vec<Vec<String>> = RecordBatches::new(vec![a, b], 2, first_column)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(
            batches,
            vec![
                vec!["1".to_string(), "2".to_string()],
                vec!["3".to_string()],
                vec!["4".to_string(), "5".to_string()],
            ]
        );
    }

    #[test]
    fn test_missing_file_reports_error_and_continues() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.csv");
        fs::write(&good, "v\n7\n").unwrap();

        let mut batches =
            RecordBatches::new(vec![dir.path().join("missing.csv"), good], 10, first_column);
        assert!(matches!(batches.next(), Some(Err(ReplayError::Dataset { .. }))));
        assert_eq!(batches.next().unwrap().unwrap(), vec!["7".to_string()]);
        assert!(batches.next().is_none());
    }
}
