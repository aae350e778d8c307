//! Latency bound for blocking operations.
//!
//! The guarded operation runs on its own thread while the caller waits on a
//! channel. When the deadline passes the caller is unblocked and the
//! operation's [`CancellationToken`] is cancelled; the operation is expected
//! to poll it, but nothing forces it to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::TimeoutError;

/// Cooperative cancellation flag shared with a guarded operation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Races an operation against a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    duration: Duration,
}

impl TimeoutGuard {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `op`, returning its output or [`TimeoutError::Elapsed`].
    ///
    /// On expiry the token handed to `op` is cancelled and the worker thread
    /// is left to finish on its own; its result is discarded.
    pub fn run<T, F>(&self, op: F) -> Result<T, TimeoutError>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let child_token = token.clone();
        let (tx, rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("timeout-guard".to_string())
            .spawn(move || {
                // Receiver may be gone after a timeout.
                let _ = tx.send(op(child_token));
            })
            .map_err(|e| TimeoutError::Spawn(e.to_string()))?;

        match rx.recv_timeout(self.duration) {
            Ok(value) => Ok(value),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                token.cancel();
                warn!(
                    timeout_ms = self.duration.as_millis() as u64,
                    "guarded operation timed out, cancellation signalled"
                );
                Err(TimeoutError::Elapsed {
                    after: self.duration,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TimeoutError::Panicked),
        }
    }
}
