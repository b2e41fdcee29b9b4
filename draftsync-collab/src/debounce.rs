//! Trailing-edge debounce primitive.
//!
//! A `Debouncer` holds the most recent submitted value and emits it exactly
//! once after the input has been quiet for the configured period. Every
//! submit restarts the timer, so within a burst only the final value is ever
//! emitted. The primitive is a plain task over channels, independent of any
//! UI lifecycle.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

/// Debounces a stream of values down to the last one per quiet period.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn a debounce task that calls `emit` with the final value of each
    /// burst, once the input has been quiet for `quiet_period`.
    pub fn new(quiet_period: Duration, mut emit: impl FnMut(T) + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut pending = first;
                loop {
                    match time::timeout(quiet_period, rx.recv()).await {
                        // Newer value within the window: restart the timer.
                        Ok(Some(next)) => pending = next,
                        // Input channel closed: flush and stop.
                        Ok(None) => {
                            emit(pending);
                            return;
                        }
                        // Quiet period elapsed: emit the final value.
                        Err(_) => {
                            emit(pending);
                            break;
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// Submit a value, restarting the quiet-period timer.
    ///
    /// Returns `false` once the debounce task has stopped.
    pub fn submit(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}
