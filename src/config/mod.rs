//! Configuration hierarchy
//!
//! - `schema`: settings document, run-wide and per-job configuration types
//! - `store`: JSON persistence and per-source resolution

pub mod schema;
pub mod store;

pub use schema::{JobConfig, RecordingMode, RunConfig, SettingsDocument, SourceSettings};
pub use store::ConfigStore;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("No settings section for {0}")]
    NoSection(String),
}
