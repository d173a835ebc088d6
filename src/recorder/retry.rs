//! Retry backoff

use std::time::Duration;

/// Waits applied before retrying after a transient failure.
///
/// Fixed in production; tests construct shorter ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// After a dropped connection. The playback URL is resolved again.
    pub network_backoff: Duration,
    /// After a malformed or unexpected resolver response
    pub protocol_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_backoff: Duration::from_secs(120),
            protocol_backoff: Duration::from_secs(2),
        }
    }
}
