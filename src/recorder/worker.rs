//! Per-source recording worker
//!
//! One worker drives one source from its first liveness check to a terminal
//! state. It is a loop over explicit steps:
//!
//! ```text
//! Resolve ──live──▶ Record ──resolution change──▶ Resolve
//!    │                 ├──network error──▶ Backoff ──▶ Resolve
//!    ├──not live──▶ Wait ──▶ Resolve          (automatic mode)
//!    └──protocol error──▶ Backoff ──▶ Resolve
//! ```
//!
//! Everything else ends in `Done`. All waits race the stop signal.

use super::progress::ProgressRegistry;
use super::retry::RetryPolicy;
use super::state::{
    FailureKind, JobResult, RecorderEvent, RecordingSegment, SegmentEndReason, TerminalReason,
    WorkerState,
};
use crate::capture::{CaptureBackend, CaptureExit};
use crate::config::{JobConfig, RecordingMode};
use crate::resolution::{ResolutionChange, ResolutionMonitor, ResolutionProbe};
use crate::source::{Liveness, ResolveError, SourceDescriptor, SourceResolver};
use crate::utils::format::{format_hms, format_megabytes};
use crate::utils::StopSignal;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// How often the active file's size is sampled
const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Collaborators shared by every worker of a run
#[derive(Clone)]
pub struct WorkerServices {
    pub resolver: Arc<dyn SourceResolver>,
    pub capture: Arc<dyn CaptureBackend>,
    pub probe: Arc<dyn ResolutionProbe>,
    pub registry: Arc<ProgressRegistry>,
    pub events: broadcast::Sender<RecorderEvent>,
    pub retry: RetryPolicy,
}

enum Step {
    Resolve,
    Wait(Duration),
    Backoff(Duration),
    Record(String),
    Done(TerminalReason),
}

enum SegmentOutcome {
    Exited(CaptureExit),
    ResolutionChanged(ResolutionChange),
    DurationLimit,
    Stopped,
}

/// The file currently being written
struct ActiveSegment {
    index: u32,
    path: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    /// Already included in the progress segment count
    counted: bool,
}

pub struct RecordingWorker {
    source: SourceDescriptor,
    key: String,
    config: JobConfig,
    services: WorkerServices,
    stop: StopSignal,
    launch_delay: Duration,
    state: WorkerState,
    segments: Vec<RecordingSegment>,
    next_index: u32,
    /// Start of the first segment; the duration limit counts from here
    session_started: Option<Instant>,
}

impl RecordingWorker {
    pub fn new(
        source: SourceDescriptor,
        config: JobConfig,
        services: WorkerServices,
        stop: StopSignal,
    ) -> Self {
        let state = Self::initial_state(&config);
        Self {
            key: source.key(),
            source,
            config,
            services,
            stop,
            launch_delay: Duration::ZERO,
            state,
            segments: Vec::new(),
            next_index: 1,
            session_started: None,
        }
    }

    /// Delay the first liveness check
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// State a job reports before its worker has done anything
    pub fn initial_state(config: &JobConfig) -> WorkerState {
        match config.mode {
            RecordingMode::Automatic => WorkerState::Waiting,
            RecordingMode::Manual => WorkerState::Starting,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Drive the source to a terminal state
    pub async fn run(self) -> JobResult {
        let span = tracing::info_span!("source", key = %self.key);
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> JobResult {
        tracing::info!("Worker started for {} ({:?} mode)", self.source, self.config.mode);

        let mut step = if self.launch_delay.is_zero() || self.stop.sleep(self.launch_delay).await {
            Step::Resolve
        } else {
            Step::Done(TerminalReason::Stopped)
        };

        let reason = loop {
            step = match step {
                Step::Resolve => self.resolve().await,
                Step::Wait(interval) => {
                    self.set_state(WorkerState::Waiting);
                    tracing::debug!("Not live, checking again in {:?}", interval);
                    self.pause(interval).await
                }
                Step::Backoff(delay) => {
                    tracing::info!("Retrying in {:?}", delay);
                    self.pause(delay).await
                }
                Step::Record(url) => self.record(url).await,
                Step::Done(reason) => break reason,
            };
        };

        self.finish(reason)
    }

    async fn pause(&self, duration: Duration) -> Step {
        if self.stop.sleep(duration).await {
            Step::Resolve
        } else {
            Step::Done(TerminalReason::Stopped)
        }
    }

    async fn resolve(&mut self) -> Step {
        // Polling in automatic mode stays in Waiting
        if self.state != WorkerState::Waiting {
            self.set_state(WorkerState::Starting);
        }

        let answer = tokio::select! {
            biased;
            _ = self.stop.triggered() => return Step::Done(TerminalReason::Stopped),
            answer = self.services.resolver.resolve(&self.source) => answer,
        };

        match answer {
            Ok(Liveness::Live { url }) => Step::Record(url),
            Ok(Liveness::NotLive) if !self.segments.is_empty() => {
                tracing::info!("Source is no longer live");
                Step::Done(TerminalReason::SourceOffline)
            }
            Ok(Liveness::NotLive) => match self.config.mode {
                RecordingMode::Automatic => Step::Wait(self.config.poll_interval),
                RecordingMode::Manual => Step::Done(TerminalReason::failed(
                    FailureKind::SourceNotLive,
                    format!("{} is not live", self.source),
                )),
            },
            Err(ResolveError::NotFound(message)) => {
                Step::Done(TerminalReason::failed(FailureKind::SourceNotFound, message))
            }
            Err(ResolveError::Unavailable(message)) => {
                Step::Done(TerminalReason::failed(FailureKind::ResolverUnavailable, message))
            }
            Err(err @ ResolveError::Network(_)) => {
                tracing::warn!("Resolver failed: {}", err);
                self.note_error(&err.to_string());
                Step::Backoff(self.services.retry.network_backoff)
            }
            Err(err @ ResolveError::Protocol(_)) => {
                tracing::warn!("Resolver failed: {}", err);
                self.note_error(&err.to_string());
                Step::Backoff(self.services.retry.protocol_backoff)
            }
        }
    }

    async fn record(&mut self, url: String) -> Step {
        let now = Instant::now();
        let session_start = *self.session_started.get_or_insert(now);
        let deadline = self.config.max_duration.map(|limit| session_start + limit);
        if deadline.map_or(false, |deadline| deadline <= now) {
            tracing::info!("Duration limit reached");
            return Step::Done(TerminalReason::DurationLimit);
        }

        self.set_state(WorkerState::Starting);

        let index = self.next_index;
        self.next_index += 1;

        let dir = self.config.output_directory.join(&self.key);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Step::Done(TerminalReason::failed(
                FailureKind::Io,
                format!("cannot create {}: {}", dir.display(), e),
            ));
        }
        let started_at = Utc::now();
        let path = dir.join(segment_file_name(&self.key, started_at, index));

        let mut session = match self.services.capture.start(&url, &path).await {
            Ok(session) => session,
            Err(e) => {
                return Step::Done(TerminalReason::failed(FailureKind::CaptureLaunch, e.to_string()))
            }
        };

        let mut segment = ActiveSegment {
            index,
            path,
            started_at,
            started: Instant::now(),
            counted: false,
        };

        self.set_state(WorkerState::Recording);
        self.services.registry.update(&self.key, |p| {
            p.segment_bytes = 0;
            p.segment_duration = Duration::ZERO;
        });
        self.emit(RecorderEvent::SegmentStarted {
            key: self.key.clone(),
            index,
            path: segment.path.clone(),
        });
        tracing::info!("Recording segment {} to {}", index, segment.path.display());

        // Scoped to this segment so the monitor ends with it
        let segment_stop = self.stop.child();
        let mut restart = if self.config.restart_on_resolution_change {
            let monitor = ResolutionMonitor::new(
                self.services.probe.clone(),
                url.as_str(),
                self.config.resolution_check_interval,
            );
            Some(monitor.spawn(segment_stop.clone()))
        } else {
            None
        };

        let stop = self.stop.clone();
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop.triggered() => break SegmentOutcome::Stopped,
                exit = session.wait_exit() => break SegmentOutcome::Exited(exit),
                change = restart_requested(&mut restart) => break SegmentOutcome::ResolutionChanged(change),
                _ = sleep_until_deadline(deadline) => break SegmentOutcome::DurationLimit,
                _ = tick.tick() => self.observe(&mut segment).await,
            }
        };
        segment_stop.trigger();

        match outcome {
            SegmentOutcome::Stopped => {
                let exit = session.stop().await;
                tracing::debug!("Capture stopped: {:?}", exit);
                self.finalize(segment, SegmentEndReason::Stopped).await;
                Step::Done(TerminalReason::Stopped)
            }
            SegmentOutcome::DurationLimit => {
                tracing::info!("Duration limit reached");
                let exit = session.stop().await;
                tracing::debug!("Capture stopped: {:?}", exit);
                self.finalize(segment, SegmentEndReason::DurationLimit).await;
                Step::Done(TerminalReason::DurationLimit)
            }
            SegmentOutcome::ResolutionChanged(change) => {
                tracing::info!(
                    "Restarting capture for resolution {} (was {})",
                    change.current,
                    change.previous
                );
                self.set_state(WorkerState::Restarting);
                let exit = session.stop().await;
                tracing::debug!("Capture stopped: {:?}", exit);
                self.finalize(segment, SegmentEndReason::ResolutionChange).await;
                Step::Resolve
            }
            SegmentOutcome::Exited(CaptureExit::Normal) => {
                tracing::info!("Stream ended");
                self.finalize(segment, SegmentEndReason::Offline).await;
                Step::Done(TerminalReason::SourceOffline)
            }
            SegmentOutcome::Exited(CaptureExit::TransientNetworkError(message)) => {
                tracing::warn!("Capture interrupted: {}", message);
                self.finalize(segment, SegmentEndReason::Error).await;
                self.set_state(WorkerState::Restarting);
                self.note_error(&message);
                Step::Backoff(self.services.retry.network_backoff)
            }
            SegmentOutcome::Exited(CaptureExit::FatalError(message)) => {
                self.finalize(segment, SegmentEndReason::Error).await;
                Step::Done(TerminalReason::failed(FailureKind::CaptureFatal, message))
            }
        }
    }

    /// Publish the active file's size and age
    async fn observe(&self, segment: &mut ActiveSegment) {
        let bytes = file_size(&segment.path).await;
        let duration = segment.started.elapsed();
        let first_data = bytes > 0 && !segment.counted;
        if first_data {
            segment.counted = true;
        }

        self.services.registry.update(&self.key, |p| {
            p.segment_bytes = bytes;
            p.segment_duration = duration;
            if first_data {
                p.segment_count += 1;
            }
        });
    }

    /// Close the segment: keep it if it holds data, delete it otherwise
    async fn finalize(&mut self, segment: ActiveSegment, reason: SegmentEndReason) {
        let bytes = file_size(&segment.path).await;
        let duration = segment.started.elapsed();

        if bytes == 0 {
            match tokio::fs::remove_file(&segment.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Could not remove empty segment {}: {}",
                    segment.path.display(),
                    e
                ),
            }
            tracing::debug!("Discarded empty segment {}", segment.index);
            self.services.registry.update(&self.key, |p| {
                p.segment_bytes = 0;
                p.segment_duration = Duration::ZERO;
            });
            return;
        }

        let record = RecordingSegment {
            index: segment.index,
            path: segment.path,
            started_at: segment.started_at,
            ended_at: Utc::now(),
            duration,
            bytes,
            end_reason: reason,
        };
        tracing::info!(
            "Closed segment {} ({:?}): {} in {}",
            record.index,
            reason,
            format_megabytes(bytes),
            format_hms(duration)
        );

        self.segments.push(record.clone());
        let total_bytes = self.total_bytes();
        let total_duration = self.total_duration();
        let counted = segment.counted;
        self.services.registry.update(&self.key, |p| {
            if !counted {
                p.segment_count += 1;
            }
            p.segment_bytes = 0;
            p.segment_duration = Duration::ZERO;
            p.total_bytes = total_bytes;
            p.total_duration = total_duration;
        });

        self.emit(RecorderEvent::SegmentFinished {
            key: self.key.clone(),
            segment: record,
        });
    }

    fn finish(mut self, reason: TerminalReason) -> JobResult {
        match &reason {
            TerminalReason::Failed { kind, message } => {
                tracing::error!("Failed [{}]: {}", kind, message);
                let (kind, message) = (*kind, message.clone());
                self.services.registry.update(&self.key, |p| {
                    p.failure = Some(kind);
                    p.last_error = Some(message);
                });
            }
            other => tracing::info!("Finished: {}", other),
        }

        let state = reason.state();
        self.set_state(state);

        let total_bytes = self.total_bytes();
        let total_duration = self.total_duration();
        let result = JobResult {
            key: self.key,
            source: self.source,
            state,
            reason,
            total_segments: self.segments.len(),
            total_bytes,
            total_duration,
            segments: self.segments,
        };

        let _ = self.services.events.send(RecorderEvent::JobFinished(result.clone()));
        result
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state == state {
            return;
        }
        tracing::debug!("{} -> {}", self.state, state);
        self.state = state;
        self.services.registry.update(&self.key, |p| p.state = state);
        self.emit(RecorderEvent::StateChanged {
            key: self.key.clone(),
            state,
        });
    }

    fn note_error(&self, message: &str) {
        self.services
            .registry
            .update(&self.key, |p| p.last_error = Some(message.to_string()));
    }

    fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine
        let _ = self.services.events.send(event);
    }

    fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    fn total_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// `<key>_<YYYY.MM.DD_HH-MM-SS>_<NN>.ts`, local time
pub fn segment_file_name(key: &str, started_at: DateTime<Utc>, index: u32) -> String {
    format!(
        "{}_{}_{:02}.ts",
        key,
        started_at.with_timezone(&Local).format("%Y.%m.%d_%H-%M-%S"),
        index
    )
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

/// Resolves with the monitor's change. Pends forever when there is no
/// monitor or the monitor ended without one.
async fn restart_requested(
    restart: &mut Option<oneshot::Receiver<ResolutionChange>>,
) -> ResolutionChange {
    let received = match restart.as_mut() {
        Some(rx) => rx.await,
        None => return std::future::pending().await,
    };
    match received {
        Ok(change) => change,
        Err(_) => {
            *restart = None;
            std::future::pending().await
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
