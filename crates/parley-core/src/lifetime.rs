//! Cancellation context shared by the directory and the broker.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A cloneable, irreversible cancellation signal.
///
/// Every clone observes the same signal. Once [`Lifetime::cancel`] has been
/// called the lifetime stays cancelled.
#[derive(Debug, Clone)]
pub struct Lifetime {
    signal: Arc<watch::Sender<bool>>,
}

impl Lifetime {
    /// Create a lifetime that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    /// Cancel the lifetime. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        let was_cancelled = self.signal.send_replace(true);
        if !was_cancelled {
            debug!("Lifetime cancelled");
        }
    }

    /// Whether the lifetime has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Wait until the lifetime is cancelled.
    ///
    /// Resolves immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}
