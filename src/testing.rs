//! Scripted stand-ins for the resolver, capture and probe, used by unit tests.
//!
//! Each fake replays a script; once a script is down to its last entry that
//! entry repeats forever.

use crate::capture::{CaptureBackend, CaptureError, CaptureExit, CaptureSession};
use crate::resolution::{ProbeError, Resolution, ResolutionProbe};
use crate::source::{Liveness, ResolveError, SourceDescriptor, SourceResolver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn next<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

/// Resolver answering from a per-key script
#[derive(Default)]
pub struct ScriptedResolver {
    scripts: Mutex<HashMap<String, VecDeque<Result<Liveness, ResolveError>>>>,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, key: &str, answers: Vec<Result<Liveness, ResolveError>>) -> Self {
        self.scripts.lock().insert(key.to_string(), answers.into());
        self
    }

    /// When each call for `key` happened
    pub fn calls(&self, key: &str) -> Vec<Instant> {
        self.calls.lock().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SourceResolver for ScriptedResolver {
    async fn resolve(&self, source: &SourceDescriptor) -> Result<Liveness, ResolveError> {
        let key = source.key();
        self.calls
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Instant::now());

        let answer = self.scripts.lock().get_mut(&key).and_then(next);
        answer.unwrap_or_else(|| Err(ResolveError::NotFound(format!("no script for {}", key))))
    }
}

#[derive(Debug, Clone)]
pub enum CaptureBehaviour {
    /// Write `bytes` and keep running until stopped
    RunUntilStopped { bytes: u64 },
    /// Write `bytes` and exit with `exit` after `delay`
    ExitAfter {
        delay: Duration,
        exit: CaptureExit,
        bytes: u64,
    },
    /// Fail to launch
    LaunchFails,
}

/// Capture backend replaying a per-URL script
#[derive(Default)]
pub struct ScriptedCapture {
    scripts: Mutex<HashMap<String, VecDeque<CaptureBehaviour>>>,
    outputs: Mutex<Vec<PathBuf>>,
    stops: Arc<AtomicUsize>,
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, live_url: &str, behaviours: Vec<CaptureBehaviour>) -> Self {
        self.scripts
            .lock()
            .insert(live_url.to_string(), behaviours.into());
        self
    }

    /// Graceful stops received across all sessions
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.lock().clone()
    }
}

#[async_trait]
impl CaptureBackend for ScriptedCapture {
    async fn start(
        &self,
        live_url: &str,
        output_path: &Path,
    ) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let behaviour = self
            .scripts
            .lock()
            .get_mut(live_url)
            .and_then(next)
            .unwrap_or(CaptureBehaviour::LaunchFails);

        let (deadline, exit, bytes) = match behaviour {
            CaptureBehaviour::LaunchFails => {
                return Err(CaptureError::Launch("scripted launch failure".to_string()))
            }
            CaptureBehaviour::RunUntilStopped { bytes } => (None, CaptureExit::Normal, bytes),
            CaptureBehaviour::ExitAfter { delay, exit, bytes } => {
                (Some(tokio::time::Instant::now() + delay), exit, bytes)
            }
        };

        tokio::fs::write(output_path, vec![0u8; bytes as usize]).await?;
        self.outputs.lock().push(output_path.to_path_buf());

        Ok(Box::new(ScriptedSession {
            deadline,
            exit,
            stops: self.stops.clone(),
            stopped: false,
        }))
    }
}

struct ScriptedSession {
    deadline: Option<tokio::time::Instant>,
    exit: CaptureExit,
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

#[async_trait]
impl CaptureSession for ScriptedSession {
    async fn wait_exit(&mut self) -> CaptureExit {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.exit.clone()
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self) -> CaptureExit {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        CaptureExit::Normal
    }
}

/// Probe replaying a fixed sample sequence
pub struct ScriptedProbe {
    samples: Vec<Result<Resolution, ProbeError>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(samples: Vec<Result<Resolution, ProbeError>>) -> Self {
        Self {
            samples,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResolutionProbe for ScriptedProbe {
    async fn sample(&self, _live_url: &str) -> Result<Resolution, ProbeError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.samples
            .get(index)
            .or_else(|| self.samples.last())
            .cloned()
            .unwrap_or_else(|| Err(ProbeError::Unavailable("empty script".to_string())))
    }
}
