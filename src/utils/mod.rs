//! Shared utilities: errors, stop signalling, formatting

pub mod error;
pub mod format;
pub mod signal;

pub use error::{AppError, AppResult};
pub use signal::StopSignal;
