//! Recording system module
//!
//! - `worker`: per-source state machine (poll, record, restart, finish)
//! - `coordinator`: the orchestrator that runs one worker per source
//! - `progress`: shared progress table and run summary
//! - `retry`: backoff applied to transient failures
//! - `state`: states, segments and results

pub mod coordinator;
pub mod progress;
pub mod retry;
pub mod state;
pub mod worker;

pub use coordinator::{Orchestrator, RunHandle, DEFAULT_LAUNCH_STAGGER};
pub use progress::{FailedSource, ProgressRegistry, ProgressSnapshot, RunSummary};
pub use retry::RetryPolicy;
pub use state::{
    FailureKind, JobResult, RecorderEvent, RecordingSegment, SegmentEndReason, TerminalReason,
    WorkerState,
};
pub use worker::{RecordingWorker, WorkerServices};
