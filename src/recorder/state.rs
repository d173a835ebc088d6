//! Recording state management
//!
//! Worker states, segments, terminal reasons and the lifecycle events
//! published while a run is in progress.

use crate::source::SourceDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle state of one source's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Polling liveness (automatic mode)
    Waiting,
    /// Resolving the playback URL and launching the capture
    Starting,
    /// Capture running
    Recording,
    /// Closing the current segment before starting a new one
    Restarting,
    /// Source went offline or the duration limit was reached
    Completed,
    /// Unrecoverable error
    Failed,
    /// Cancelled from outside
    Stopped,
}

impl WorkerState {
    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Waiting => "waiting",
            WorkerState::Starting => "starting",
            WorkerState::Recording => "recording",
            WorkerState::Restarting => "restarting",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a segment file was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentEndReason {
    Offline,
    ResolutionChange,
    DurationLimit,
    Error,
    Stopped,
}

/// One finished output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Per-job sequence number, also embedded in the file name
    pub index: u32,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    /// Size when the segment was closed
    pub bytes: u64,
    pub end_reason: SegmentEndReason,
}

/// Failure classification reported for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceNotLive,
    SourceNotFound,
    ResolverUnavailable,
    CaptureLaunch,
    CaptureFatal,
    Io,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceNotLive => "source_not_live",
            FailureKind::SourceNotFound => "source_not_found",
            FailureKind::ResolverUnavailable => "resolver_unavailable",
            FailureKind::CaptureLaunch => "capture_launch",
            FailureKind::CaptureFatal => "capture_fatal",
            FailureKind::Io => "io",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    /// The broadcast ended
    SourceOffline,
    /// The session reached its configured length
    DurationLimit,
    /// Stop was requested
    Stopped,
    Failed { kind: FailureKind, message: String },
}

impl TerminalReason {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        TerminalReason::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Terminal state this reason leads to
    pub fn state(&self) -> WorkerState {
        match self {
            TerminalReason::SourceOffline | TerminalReason::DurationLimit => WorkerState::Completed,
            TerminalReason::Stopped => WorkerState::Stopped,
            TerminalReason::Failed { .. } => WorkerState::Failed,
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::SourceOffline => f.write_str("source went offline"),
            TerminalReason::DurationLimit => f.write_str("duration limit reached"),
            TerminalReason::Stopped => f.write_str("stopped"),
            TerminalReason::Failed { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// Final outcome of one source's job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub key: String,
    pub source: SourceDescriptor,
    pub state: WorkerState,
    pub reason: TerminalReason,
    pub segments: Vec<RecordingSegment>,
    pub total_segments: usize,
    pub total_bytes: u64,
    pub total_duration: Duration,
}

impl JobResult {
    /// Result for a worker that ended without reporting back
    pub fn internal_failure(key: String, source: SourceDescriptor, message: impl Into<String>) -> Self {
        Self {
            key,
            source,
            state: WorkerState::Failed,
            reason: TerminalReason::failed(FailureKind::Internal, message),
            segments: Vec::new(),
            total_segments: 0,
            total_bytes: 0,
            total_duration: Duration::ZERO,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.reason {
            TerminalReason::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Lifecycle events, for post-processors that react to finished segments
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    StateChanged { key: String, state: WorkerState },
    SegmentStarted { key: String, index: u32, path: PathBuf },
    SegmentFinished { key: String, segment: RecordingSegment },
    JobFinished(JobResult),
}
