//! Error types and handling
//!
//! Crate-wide error type for the failures that reach the orchestrator
//! boundary. Per-source problems never surface here; they end up in a
//! `JobResult` instead.

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AppError {
    /// Short machine-readable code, used in logs and the exit summary
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
