//! Capture processes
//!
//! `traits` defines what the recorder needs from a capture; `ffmpeg` is the
//! production implementation.

pub mod ffmpeg;
pub mod traits;

pub use ffmpeg::FfmpegCapture;
pub use traits::{CaptureBackend, CaptureError, CaptureExit, CaptureSession};
