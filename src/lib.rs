//! Multistream Recorder - record many live streams at once.
//!
//! This is the library crate behind the `multistream-recorder` binary. It
//! provides the orchestrator, the per-source recording workers, resolution
//! change detection, the settings hierarchy, and the ffmpeg/ffprobe adapters.

pub mod capture;
pub mod config;
pub mod recorder;
pub mod resolution;
pub mod source;
pub mod utils;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{ConfigStore, JobConfig, RecordingMode, RunConfig};
pub use recorder::{JobResult, Orchestrator, ProgressRegistry, RunHandle, RunSummary, WorkerState};
pub use source::SourceDescriptor;

/// Initialize logging. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multistream_recorder=info,multistream_recorder_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Multistream Recorder v{}", env!("CARGO_PKG_VERSION"));
}
