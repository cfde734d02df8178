//! Session-wide cancellation
//!
//! A single watch channel flipped once from `false` to `true`. Every loader,
//! replayer and readiness poll holds a [`CancelToken`] and races its sleeps
//! against it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Owner side; cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> CancelHandle {
    let (tx, _rx) = watch::channel(false);
    CancelHandle { tx: Arc::new(tx) }
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace stores the value even with no receivers alive.
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// Token that never fires, for one-off loads outside a session.
    pub fn never() -> Self {
        // Closed channel with `false` stored: `cancelled()` pends forever.
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let handle = cancellation();
        assert!(handle.token().sleep(Duration::from_secs(30)).await);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let handle = cancellation();
        let token = handle.token();
        let sleeper = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let finished = token.sleep(Duration::from_secs(3600)).await;
            (finished, started.elapsed())
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let (finished, waited) = sleeper.await.unwrap();
        assert!(!finished);
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tokens_see_earlier_cancel() {
        let handle = cancellation();
        handle.cancel();
        let token = handle.token();
        assert!(token.is_cancelled());
        assert!(!token.sleep(Duration::from_secs(1)).await);
        assert!(!CancelToken::never().is_cancelled());
    }
}
