//! One-shot stop latch
//!
//! A `StopSignal` starts unset and can be triggered exactly once; later
//! triggers are no-ops. Child signals fire when their parent fires, which is
//! how a single global stop reaches every worker while still allowing one
//! worker (or one segment) to be cancelled on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cloneable, monotonic stop signal
#[derive(Clone)]
pub struct StopSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive a signal that fires with this one but can also be fired alone
    pub fn child(&self) -> Self {
        Self::from_token(self.token.child_token())
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn trigger(&self) -> bool {
        // A token cancelled through its parent was not set by this call
        let first = !self.token.is_cancelled() && !self.fired.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is set (immediately if it already is)
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless the signal fires first.
    ///
    /// Returns `true` when the full duration elapsed, `false` when stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
