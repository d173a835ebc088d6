//! FFmpeg capture process
//!
//! Remuxes the live stream into MPEG-TS (`-c copy`), which stays playable
//! even when the process is cut off. stderr is drained continuously into a
//! short tail used to classify the exit.

use super::traits::{CaptureBackend, CaptureError, CaptureExit, CaptureSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lines of stderr kept for exit classification
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the last stderr lines after the process exits
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How long a graceful stop may take before the process is killed
const STOP_GRACE: Duration = Duration::from_secs(10);

/// stderr fragments that mean the connection, not the input, went wrong
const NETWORK_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection timed out",
    "connection aborted",
    "broken pipe",
    "network is unreachable",
    "i/o error",
    "input/output error",
    "server returned 4",
    "server returned 5",
    "end of file",
    "timed out",
];

/// Capture backend that shells out to `ffmpeg`
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    program: String,
}

impl FfmpegCapture {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }

    /// Use a specific ffmpeg binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(live_url: &str, output_path: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            live_url.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "mpegts".to_string(),
            output_path.to_string_lossy().to_string(),
        ]
    }
}

impl Default for FfmpegCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for FfmpegCapture {
    async fn start(
        &self,
        live_url: &str,
        output_path: &Path,
    ) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let args = Self::build_args(live_url, output_path);
        tracing::debug!("Starting {} {:?}", self.program, args);

        let mut command = Command::new(&self.program);
        command.args(&args);
        let session = FfmpegSession::spawn(command)
            .map_err(|e| CaptureError::Launch(format!("failed to start {}: {}", self.program, e)))?;
        Ok(Box::new(session))
    }
}

struct FfmpegSession {
    process: Child,
    stdin: Option<ChildStdin>,
    tail: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
    /// Set once the drain wait has begun, so a resumed wait keeps the same deadline
    drain_deadline: Option<Instant>,
    status: Option<std::io::Result<ExitStatus>>,
    exit: Option<CaptureExit>,
}

impl FfmpegSession {
    fn spawn(mut command: Command) -> std::io::Result<Self> {
        let mut process = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = process.stdin.take();
        let stderr = process.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "stderr was not captured")
        })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let drain_tail = tail.clone();
        let drain = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!("ffmpeg: {}", line);
                let mut tail = drain_tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(Self {
            process,
            stdin,
            tail,
            drain: Some(drain),
            drain_deadline: None,
            status: None,
            exit: None,
        })
    }

    /// Classify the recorded exit status.
    ///
    /// Safe to cancel and call again: the status and the drain task stay in
    /// `self` until classification is done.
    async fn finish(&mut self) -> CaptureExit {
        // Let the drain task pick up the last lines before classifying
        if let Some(drain) = self.drain.as_mut() {
            let deadline = *self
                .drain_deadline
                .get_or_insert_with(|| Instant::now() + DRAIN_GRACE);
            let _ = tokio::time::timeout_at(deadline, drain).await;
            self.drain = None;
        }

        let exit = match &self.status {
            Some(Ok(status)) => {
                let tail: Vec<String> = self.tail.lock().iter().cloned().collect();
                classify_exit(status.success(), &tail)
            }
            Some(Err(e)) => CaptureExit::FatalError(format!("failed to wait for ffmpeg: {}", e)),
            None => CaptureExit::FatalError("ffmpeg exit status was not collected".to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }
}

#[async_trait]
impl CaptureSession for FfmpegSession {
    async fn wait_exit(&mut self) -> CaptureExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        if self.status.is_none() {
            self.status = Some(self.process.wait().await);
        }
        self.finish().await
    }

    async fn stop(&mut self) -> CaptureExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        if self.status.is_some() {
            return self.finish().await;
        }

        if let Some(mut stdin) = self.stdin.take() {
            // ffmpeg finishes the current packet and closes the file on `q`
            if let Err(e) = stdin.write_all(b"q").await {
                tracing::debug!("Could not send quit to ffmpeg: {}", e);
            }
            let _ = stdin.flush().await;
        }

        let status = match tokio::time::timeout(STOP_GRACE, self.process.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!("ffmpeg did not exit within {:?}, killing it", STOP_GRACE);
                if let Err(e) = self.process.kill().await {
                    tracing::warn!("Failed to kill ffmpeg: {}", e);
                }
                self.process.wait().await
            }
        };
        self.status = Some(status);

        self.finish().await
    }
}

/// Classify an ffmpeg exit from its status and stderr tail
pub fn classify_exit(success: bool, stderr_tail: &[String]) -> CaptureExit {
    if success {
        return CaptureExit::Normal;
    }

    let last_line = stderr_tail
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| "ffmpeg exited with an error".to_string());

    let network = stderr_tail.iter().any(|line| {
        let lower = line.to_lowercase();
        NETWORK_MARKERS.iter().any(|marker| lower.contains(marker))
    });

    if network {
        CaptureExit::TransientNetworkError(last_line)
    } else {
        CaptureExit::FatalError(last_line)
    }
}
