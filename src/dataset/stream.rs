//! Async hand-off between blocking CSV reads and the async loaders.

use crate::error::ReplayResult;
use tokio::sync::mpsc;
use tracing::warn;

/// Bounded stream of record batches, fed from a blocking reader thread.
///
/// Backpressure comes from the channel bound: the reader parks once
/// `buffer` batches are waiting, so memory stays at a few chunks per type.
pub struct RecordStream<T> {
    rx: mpsc::Receiver<Vec<T>>,
}

impl<T: Send + 'static> RecordStream<T> {
    /// Drive `batches` on the blocking pool. Unreadable files are logged and
    /// skipped; the stream ends when the source is exhausted.
    pub fn spawn<I>(batches: I, buffer: usize) -> Self
    where
        I: Iterator<Item = ReplayResult<Vec<T>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::task::spawn_blocking(move || {
            for batch in batches {
                match batch {
                    Ok(records) => {
                        if tx.blocking_send(records).is_err() {
                            // Consumer went away (cancelled or finished early).
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable dataset file"),
                }
            }
        });
        Self { rx }
    }

    /// Stream over already materialized batches.
    pub fn from_batches(batches: Vec<Vec<T>>) -> Self {
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            // Capacity covers every batch, so this cannot fail.
            let _ = tx.try_send(batch);
        }
        Self { rx }
    }

    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        self.rx.recv().await
    }
}
