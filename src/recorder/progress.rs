//! Shared progress table
//!
//! Workers write their snapshot here at most once a second; dashboards and
//! the final report read copies. One lock guards the whole map.

use super::state::{FailureKind, WorkerState};
use crate::utils::format::{format_hms, format_megabytes};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Progress of one source, overwritten in place
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Human-readable source name
    pub display: String,
    pub state: WorkerState,
    pub segment_duration: Duration,
    pub segment_bytes: u64,
    /// Segments that received data; never decreases
    pub segment_count: u32,
    pub total_bytes: u64,
    pub total_duration: Duration,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    fn new(display: String, state: WorkerState) -> Self {
        Self {
            display,
            state,
            segment_duration: Duration::ZERO,
            segment_bytes: 0,
            segment_count: 0,
            total_bytes: 0,
            total_duration: Duration::ZERO,
            last_error: None,
            failure: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: Mutex<BTreeMap<String, ProgressSnapshot>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source, replacing any previous entry under the same key
    pub fn register(&self, key: &str, display: impl Into<String>, state: WorkerState) {
        self.entries
            .lock()
            .insert(key.to_string(), ProgressSnapshot::new(display.into(), state));
    }

    /// Modify one entry under the lock. Unknown keys are ignored.
    pub fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut ProgressSnapshot),
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            f(entry);
            entry.updated_at = Utc::now();
        }
    }

    pub fn get(&self, key: &str) -> Option<ProgressSnapshot> {
        self.entries.lock().get(key).cloned()
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, ProgressSnapshot> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Counts by state and aggregate totals
    pub fn summary(&self) -> RunSummary {
        let entries = self.snapshot();
        let mut summary = RunSummary::default();

        for (key, entry) in &entries {
            match entry.state {
                WorkerState::Waiting => summary.waiting += 1,
                WorkerState::Starting => summary.starting += 1,
                WorkerState::Recording => summary.recording += 1,
                WorkerState::Restarting => summary.restarting += 1,
                WorkerState::Completed => summary.completed += 1,
                WorkerState::Failed => {
                    summary.failed += 1;
                    summary.failures.push(FailedSource {
                        key: key.clone(),
                        kind: entry.failure.unwrap_or(FailureKind::Internal),
                        cause: entry.last_error.clone().unwrap_or_default(),
                    });
                }
                WorkerState::Stopped => summary.stopped += 1,
            }
            summary.sources += 1;
            summary.segments += entry.segment_count as usize;
            // Include the segment in flight so live totals keep moving
            let active = matches!(entry.state, WorkerState::Recording);
            summary.total_bytes += entry.total_bytes + if active { entry.segment_bytes } else { 0 };
            summary.total_duration += entry.total_duration
                + if active { entry.segment_duration } else { Duration::ZERO };
        }

        summary
    }
}

/// A failed source as listed in the summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSource {
    pub key: String,
    pub kind: FailureKind,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sources: usize,
    pub waiting: usize,
    pub starting: usize,
    pub recording: usize,
    pub restarting: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub segments: usize,
    pub total_bytes: u64,
    pub total_duration: Duration,
    pub failures: Vec<FailedSource>,
}

impl RunSummary {
    /// Sources still doing work
    pub fn active(&self) -> usize {
        self.starting + self.recording + self.restarting
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sources:    {}", self.sources)?;
        writeln!(
            f,
            "  recording {} | waiting {} | starting {} | restarting {}",
            self.recording, self.waiting, self.starting, self.restarting
        )?;
        writeln!(
            f,
            "  completed {} | stopped {} | failed {}",
            self.completed, self.stopped, self.failed
        )?;
        writeln!(f, "Segments:   {}", self.segments)?;
        writeln!(f, "Recorded:   {}", format_hms(self.total_duration))?;
        write!(f, "Size:       {}", format_megabytes(self.total_bytes))?;

        if !self.failures.is_empty() {
            write!(f, "\nFailed sources:")?;
            for failure in &self.failures {
                write!(f, "\n  {} [{}] {}", failure.key, failure.kind, failure.cause)?;
            }
        }
        Ok(())
    }
}
