//! Recording orchestrator
//!
//! Turns a list of sources into one concurrently running worker each and
//! hands back a [`RunHandle`] for stopping, watching and collecting the run.

use super::progress::{ProgressRegistry, RunSummary};
use super::retry::RetryPolicy;
use super::state::{JobResult, RecorderEvent, TerminalReason, WorkerState};
use super::worker::{RecordingWorker, WorkerServices};
use crate::capture::CaptureBackend;
use crate::config::ConfigStore;
use crate::resolution::ResolutionProbe;
use crate::source::{SourceDescriptor, SourceResolver};
use crate::utils::{AppError, AppResult, StopSignal};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default gap between consecutive worker launches
pub const DEFAULT_LAUNCH_STAGGER: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 256;

/// Starts runs against a fixed set of collaborators
pub struct Orchestrator {
    resolver: Arc<dyn SourceResolver>,
    capture: Arc<dyn CaptureBackend>,
    probe: Arc<dyn ResolutionProbe>,
    retry: RetryPolicy,
    launch_stagger: Duration,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        capture: Arc<dyn CaptureBackend>,
        probe: Arc<dyn ResolutionProbe>,
    ) -> Self {
        Self {
            resolver,
            capture,
            probe,
            retry: RetryPolicy::default(),
            launch_stagger: DEFAULT_LAUNCH_STAGGER,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_launch_stagger(mut self, stagger: Duration) -> Self {
        self.launch_stagger = stagger;
        self
    }

    /// Spawn one worker per source and return without waiting for them.
    ///
    /// Fails only for requests that cannot run at all: no sources, mixed
    /// kinds when the run requires a single kind, or unresolvable settings.
    pub fn start(&self, sources: Vec<SourceDescriptor>, config: &ConfigStore) -> AppResult<RunHandle> {
        let first_kind = match sources.first() {
            Some(source) => source.kind(),
            None => return Err(AppError::InvalidRequest("no sources to record".to_string())),
        };

        if sources.iter().any(|source| source.kind() != first_kind) {
            if config.base().exclusive_kinds {
                return Err(AppError::InvalidRequest(
                    "sources of different kinds cannot be mixed in one run".to_string(),
                ));
            }
            tracing::warn!("Mixing source kinds in one run; settings are resolved per kind");
        }

        // One worker per source; keys name output directories, so they must not clash
        let mut seen = HashSet::new();
        let mut keys = HashSet::new();
        let mut jobs = Vec::with_capacity(sources.len());
        for source in sources {
            if !seen.insert(source.identity()) {
                tracing::warn!("Ignoring duplicate source {}", source);
                continue;
            }
            if !keys.insert(source.key()) {
                return Err(AppError::InvalidRequest(format!(
                    "{} maps to output key {} already used by another source",
                    source,
                    source.key()
                )));
            }
            let job = config.resolve(&source)?;
            jobs.push((source, job));
        }

        let id = Uuid::new_v4();
        let stop = StopSignal::new();
        let registry = Arc::new(ProgressRegistry::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let services = WorkerServices {
            resolver: self.resolver.clone(),
            capture: self.capture.clone(),
            probe: self.probe.clone(),
            registry: registry.clone(),
            events: events.clone(),
            retry: self.retry,
        };

        let mut workers = Vec::with_capacity(jobs.len());
        for (index, (source, job)) in jobs.into_iter().enumerate() {
            let key = source.key();
            registry.register(&key, source.to_string(), RecordingWorker::initial_state(&job));
            tracing::debug!("Job {}: {:?}", key, job);

            let worker_stop = stop.child();
            let worker = RecordingWorker::new(source.clone(), job, services.clone(), worker_stop.clone())
                .with_launch_delay(self.launch_stagger * index as u32);
            let task = tokio::spawn(worker.run());

            workers.push(WorkerHandle {
                key,
                source,
                stop: worker_stop,
                task: Some(task),
            });
        }

        tracing::info!("Run {} started with {} source(s)", id, workers.len());

        Ok(RunHandle {
            id,
            stop,
            registry,
            events,
            workers,
            results: Vec::new(),
        })
    }
}

struct WorkerHandle {
    key: String,
    source: SourceDescriptor,
    stop: StopSignal,
    task: Option<JoinHandle<JobResult>>,
}

/// A started run
pub struct RunHandle {
    id: Uuid,
    stop: StopSignal,
    registry: Arc<ProgressRegistry>,
    events: broadcast::Sender<RecorderEvent>,
    workers: Vec<WorkerHandle>,
    results: Vec<JobResult>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask every worker to stop. Returns `false` if stop was already requested.
    pub fn stop(&self) -> bool {
        let first = self.stop.trigger();
        if first {
            tracing::info!("Stopping run {}", self.id);
        }
        first
    }

    /// Stop a single source, leaving the others running
    pub fn stop_source(&self, key: &str) -> bool {
        match self.workers.iter().find(|worker| worker.key == key) {
            Some(worker) => {
                let first = worker.stop.trigger();
                if first {
                    tracing::info!("Stopping source {}", key);
                }
                first
            }
            None => false,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_triggered()
    }

    /// The run-wide stop signal, for wiring to external triggers
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.workers.iter().map(|worker| worker.key.clone()).collect()
    }

    pub fn registry(&self) -> Arc<ProgressRegistry> {
        self.registry.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Counts and totals as of now
    pub fn summary(&self) -> RunSummary {
        self.registry.summary()
    }

    /// Wait for every worker to reach a terminal state
    pub async fn await_completion(&mut self) -> Vec<JobResult> {
        for worker in &mut self.workers {
            let Some(task) = worker.task.take() else {
                continue;
            };

            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Worker for {} ended abnormally: {}", worker.key, e);
                    let result = JobResult::internal_failure(
                        worker.key.clone(),
                        worker.source.clone(),
                        e.to_string(),
                    );
                    if let TerminalReason::Failed { kind, message } = &result.reason {
                        let (kind, message) = (*kind, message.clone());
                        self.registry.update(&worker.key, |p| {
                            p.state = WorkerState::Failed;
                            p.failure = Some(kind);
                            p.last_error = Some(message);
                        });
                    }
                    result
                }
            };
            self.results.push(result);
        }

        self.results.clone()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        // Workers must not outlive an abandoned handle
        if self.workers.iter().any(|worker| worker.task.is_some()) {
            self.stop.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureExit;
    use crate::config::{RecordingMode, RunConfig, SettingsDocument, SourceSettings};
    use crate::recorder::state::FailureKind;
    use crate::source::{Liveness, ResolveError};
    use crate::testing::{CaptureBehaviour, ScriptedCapture, ScriptedProbe, ScriptedResolver};
    use std::path::Path;
    use tempfile::tempdir;

    fn store(dir: &Path) -> ConfigStore {
        let base = RunConfig {
            output_directory: dir.to_path_buf(),
            ..RunConfig::default()
        };
        ConfigStore::in_memory(SettingsDocument::default(), base)
    }

    fn live(url: &str) -> Result<Liveness, ResolveError> {
        Ok(Liveness::Live {
            url: url.to_string(),
        })
    }

    fn orchestrator(resolver: ScriptedResolver, capture: ScriptedCapture) -> Orchestrator {
        Orchestrator::new(
            Arc::new(resolver),
            Arc::new(capture),
            Arc::new(ScriptedProbe::new(vec![])),
        )
        .with_launch_stagger(Duration::ZERO)
        .with_retry_policy(RetryPolicy {
            network_backoff: Duration::from_millis(20),
            protocol_backoff: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn test_mixed_outcomes_are_summarised() {
        let dir = tempdir().unwrap();
        let resolver = ScriptedResolver::new()
            .with_script("ghost", vec![Err(ResolveError::NotFound("user does not exist".into()))])
            .with_script("alice", vec![live("mem://alice")])
            .with_script("bob", vec![live("mem://bob")]);
        let capture = ScriptedCapture::new()
            .with_script(
                "mem://alice",
                vec![CaptureBehaviour::ExitAfter {
                    delay: Duration::from_millis(20),
                    exit: CaptureExit::Normal,
                    bytes: 100,
                }],
            )
            .with_script("mem://bob", vec![CaptureBehaviour::RunUntilStopped { bytes: 50 }]);

        let mut run = orchestrator(resolver, capture)
            .start(
                vec![
                    SourceDescriptor::handle("ghost"),
                    SourceDescriptor::handle("alice"),
                    SourceDescriptor::handle("bob"),
                ],
                &store(dir.path()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(run.registry().get("bob").unwrap().state, WorkerState::Recording);
        assert!(run.stop_source("bob"));

        let results = run.await_completion().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|result| result.state.is_terminal()));

        let summary = run.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.stopped, 1);
        assert_eq!(summary.total_bytes, 150);
        assert_eq!(summary.failures[0].key, "ghost");
        assert_eq!(summary.failures[0].kind, FailureKind::SourceNotFound);

        let ghost = results.iter().find(|result| result.key == "ghost").unwrap();
        assert_eq!(ghost.failure_kind(), Some(FailureKind::SourceNotFound));
    }

    #[tokio::test]
    async fn test_stop_twice_matches_stop_once() {
        let dir = tempdir().unwrap();
        let capture = Arc::new(
            ScriptedCapture::new()
                .with_script("mem://alice", vec![CaptureBehaviour::RunUntilStopped { bytes: 10 }]),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedResolver::new().with_script("alice", vec![live("mem://alice")])),
            capture.clone(),
            Arc::new(ScriptedProbe::new(vec![])),
        )
        .with_launch_stagger(Duration::ZERO);

        let mut run = orchestrator
            .start(vec![SourceDescriptor::handle("alice")], &store(dir.path()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(run.stop());
        assert!(!run.stop());
        assert!(run.is_stopping());

        let results = run.await_completion().await;
        assert_eq!(results[0].state, WorkerState::Stopped);
        assert_eq!(results[0].total_segments, 1);
        assert_eq!(capture.stop_count(), 1);

        // Collecting again returns the same results without re-running anything
        let again = run.await_completion().await;
        assert_eq!(again.len(), 1);
        assert_eq!(capture.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_list_rejected() {
        let dir = tempdir().unwrap();
        let result = orchestrator(ScriptedResolver::new(), ScriptedCapture::new())
            .start(Vec::new(), &store(dir.path()));
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_mixed_kinds_rejected_when_exclusive() {
        let dir = tempdir().unwrap();
        let base = RunConfig {
            output_directory: dir.path().to_path_buf(),
            exclusive_kinds: true,
            ..RunConfig::default()
        };
        let config = ConfigStore::in_memory(SettingsDocument::default(), base);

        let result = orchestrator(ScriptedResolver::new(), ScriptedCapture::new()).start(
            vec![SourceDescriptor::handle("alice"), SourceDescriptor::room("42")],
            &config,
        );
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_duplicates_collapse_to_one_worker() {
        let dir = tempdir().unwrap();
        let resolver = ScriptedResolver::new().with_script("alice", vec![Ok(Liveness::NotLive)]);

        let mut run = orchestrator(resolver, ScriptedCapture::new())
            .start(
                vec![
                    SourceDescriptor::handle("alice"),
                    SourceDescriptor::handle("@alice"),
                ],
                &store(dir.path()),
            )
            .unwrap();

        assert_eq!(run.keys(), vec!["alice".to_string()]);
        let results = run.await_completion().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].failure_kind(), Some(FailureKind::SourceNotLive));
    }

    #[tokio::test]
    async fn test_urls_sharing_a_file_name_record_separately() {
        let dir = tempdir().unwrap();
        let a = SourceDescriptor::url("https://cdn-a.example/streamA/index.m3u8");
        let b = SourceDescriptor::url("https://cdn-b.example/streamB/index.m3u8");
        let resolver = ScriptedResolver::new()
            .with_script(&a.key(), vec![live("mem://a")])
            .with_script(&b.key(), vec![live("mem://b")]);
        let finish = |bytes| {
            vec![CaptureBehaviour::ExitAfter {
                delay: Duration::from_millis(10),
                exit: CaptureExit::Normal,
                bytes,
            }]
        };
        let capture = Arc::new(
            ScriptedCapture::new()
                .with_script("mem://a", finish(3))
                .with_script("mem://b", finish(5)),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(resolver),
            capture.clone(),
            Arc::new(ScriptedProbe::new(vec![])),
        )
        .with_launch_stagger(Duration::ZERO);

        let mut run = orchestrator
            .start(vec![a.clone(), b.clone()], &store(dir.path()))
            .unwrap();

        let keys = run.keys();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        let results = run.await_completion().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.state == WorkerState::Completed));
        assert_eq!(run.summary().total_bytes, 8);

        let outputs = capture.outputs();
        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0].parent(), outputs[1].parent());
        for output in &outputs {
            assert!(output.starts_with(dir.path()));
        }
    }

    #[tokio::test]
    async fn test_url_naming_a_handle_is_a_duplicate_of_that_handle() {
        let dir = tempdir().unwrap();
        let resolver = ScriptedResolver::new().with_script("alice", vec![Ok(Liveness::NotLive)]);

        let mut run = orchestrator(resolver, ScriptedCapture::new())
            .start(
                vec![
                    SourceDescriptor::url("https://www.example.com/@alice/live"),
                    SourceDescriptor::handle("alice"),
                ],
                &store(dir.path()),
            )
            .unwrap();

        assert_eq!(run.keys(), vec!["alice".to_string()]);
        assert_eq!(run.await_completion().await.len(), 1);
    }

    #[tokio::test]
    async fn test_job_config_comes_from_hierarchy() {
        let dir = tempdir().unwrap();
        let mut document = SettingsDocument::default();
        document.users.insert(
            "alice".to_string(),
            SourceSettings {
                mode: Some(RecordingMode::Automatic),
                poll_interval: Some(3600),
                ..SourceSettings::default()
            },
        );
        let base = RunConfig {
            output_directory: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let config = ConfigStore::in_memory(document, base);
        let resolver = ScriptedResolver::new()
            .with_script("alice", vec![Ok(Liveness::NotLive)])
            .with_script("bob", vec![Ok(Liveness::NotLive)]);

        let mut run = orchestrator(resolver, ScriptedCapture::new())
            .start(
                vec![SourceDescriptor::handle("alice"), SourceDescriptor::handle("bob")],
                &config,
            )
            .unwrap();

        // bob is manual and fails at once; alice waits in automatic mode
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = run.summary();
        assert_eq!(summary.waiting, 1);
        assert_eq!(summary.failed, 1);

        run.stop();
        let results = run.await_completion().await;
        let alice = results.iter().find(|result| result.key == "alice").unwrap();
        assert_eq!(alice.state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_events_report_finished_segments() {
        let dir = tempdir().unwrap();
        let resolver = ScriptedResolver::new().with_script("alice", vec![live("mem://alice")]);
        let capture = ScriptedCapture::new().with_script(
            "mem://alice",
            vec![CaptureBehaviour::ExitAfter {
                delay: Duration::from_millis(10),
                exit: CaptureExit::Normal,
                bytes: 7,
            }],
        );

        let mut run = orchestrator(resolver, capture)
            .start(vec![SourceDescriptor::handle("alice")], &store(dir.path()))
            .unwrap();
        let mut events = run.subscribe();
        run.await_completion().await;

        let mut finished_segments = 0;
        let mut finished_jobs = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                RecorderEvent::SegmentFinished { segment, .. } => {
                    finished_segments += 1;
                    assert_eq!(segment.bytes, 7);
                }
                RecorderEvent::JobFinished(result) => {
                    finished_jobs += 1;
                    assert_eq!(result.state, WorkerState::Completed);
                }
                _ => {}
            }
        }
        assert_eq!(finished_segments, 1);
        assert_eq!(finished_jobs, 1);
    }
}
