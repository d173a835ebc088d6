//! Capture trait definitions
//!
//! The process that actually pulls a live stream onto disk is external. The
//! recorder starts it, waits for it, stops it, and looks at nothing but its
//! exit classification and the size of the file it writes.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// How a capture process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    /// The source ended the broadcast
    Normal,
    /// Connection dropped or the playback URL expired; worth retrying
    TransientNetworkError(String),
    /// Anything the recorder should not retry
    FatalError(String),
}

impl CaptureExit {
    pub fn is_normal(&self) -> bool {
        matches!(self, CaptureExit::Normal)
    }
}

/// Errors raised while launching a capture
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture tool missing or misconfigured
    #[error("failed to launch capture: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Starts capture sessions
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Begin writing `live_url` to `output_path`
    async fn start(
        &self,
        live_url: &str,
        output_path: &Path,
    ) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

/// A running capture
#[async_trait]
pub trait CaptureSession: Send {
    /// Wait for the process to exit on its own.
    ///
    /// Must be cancel safe: the recorder polls it inside `select!` and drops
    /// the future whenever another event wins.
    async fn wait_exit(&mut self) -> CaptureExit;

    /// Ask the process to finish gracefully, letting trailing bytes flush,
    /// and wait for it to go away.
    async fn stop(&mut self) -> CaptureExit;
}
