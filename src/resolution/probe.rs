//! Resolution probing
//!
//! Samples the frame size of a playback URL with `ffprobe`.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Upper bound for a single probe invocation
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Probe errors. Logged by the monitor, never escalated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe tool unavailable: {0}")]
    Unavailable(String),

    #[error("probe timed out")]
    Timeout,

    #[error("probe failed: {0}")]
    Failed(String),

    #[error("no video stream in probe output")]
    NoVideoStream,
}

/// Samples the current resolution of a playback URL
#[async_trait]
pub trait ResolutionProbe: Send + Sync {
    async fn sample(&self, live_url: &str) -> Result<Resolution, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Parse `ffprobe -of json` output into the first stream's dimensions
pub fn parse_probe_output(stdout: &str) -> Result<Resolution, ProbeError> {
    let output: ProbeOutput = serde_json::from_str(stdout)
        .map_err(|e| ProbeError::Failed(format!("unreadable ffprobe output: {}", e)))?;

    output
        .streams
        .iter()
        .find_map(|stream| match (stream.width, stream.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(Resolution::new(width, height))
            }
            _ => None,
        })
        .ok_or(ProbeError::NoVideoStream)
}

/// Probe backed by the `ffprobe` binary
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: String,
}

impl FfprobeProbe {
    pub fn new() -> Self {
        Self {
            program: "ffprobe".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check that the probe binary can be executed
    pub async fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResolutionProbe for FfprobeProbe {
    async fn sample(&self, live_url: &str) -> Result<Resolution, ProbeError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "quiet",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "json=compact=1",
                "-analyzeduration",
                "1000000",
                "-probesize",
                "1000000",
                live_url,
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProbeError::Unavailable(e.to_string())),
            Err(_) => return Err(ProbeError::Timeout),
        };

        if !output.status.success() {
            return Err(ProbeError::Failed(format!(
                "ffprobe exited with {}",
                output.status
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_output() {
        let stdout = r#"{"programs":[],"streams":[{"width":1080,"height":1920}]}"#;
        assert_eq!(parse_probe_output(stdout), Ok(Resolution::new(1080, 1920)));
    }

    #[test]
    fn test_parse_skips_streams_without_dimensions() {
        let stdout = r#"{"streams":[{},{"width":720,"height":1280}]}"#;
        assert_eq!(parse_probe_output(stdout), Ok(Resolution::new(720, 1280)));
    }

    #[test]
    fn test_parse_empty_stream_list() {
        assert_eq!(
            parse_probe_output(r#"{"streams":[]}"#),
            Err(ProbeError::NoVideoStream)
        );
        assert_eq!(parse_probe_output("{}"), Err(ProbeError::NoVideoStream));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_probe_output("not json"),
            Err(ProbeError::Failed(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Resolution::new(720, 1280).to_string(), "720x1280");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let probe = FfprobeProbe::with_program("definitely-not-ffprobe-on-this-host");
        assert!(!probe.is_available().await);
        assert!(matches!(
            probe.sample("https://cdn/x.flv").await,
            Err(ProbeError::Unavailable(_))
        ));
    }
}
