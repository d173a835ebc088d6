//! Source resolution
//!
//! The platform client that turns a descriptor into a playback URL lives
//! outside this crate. The recorder only talks to it through
//! [`SourceResolver`]; two adapters are provided here:
//! - [`CommandResolver`] delegates to an external helper program
//! - [`DirectResolver`] treats URL sources as playback URLs

use super::descriptor::SourceDescriptor;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Successful resolver answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Broadcasting; capture from this URL
    Live { url: String },
    /// Exists but is not broadcasting right now
    NotLive,
}

/// Resolver failures, classified for the retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The source does not exist or was removed. Never retried.
    #[error("source not found: {0}")]
    NotFound(String),

    /// Connection reset/aborted. Retried after the long backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed or unexpected response. Retried after the short backoff.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The resolver itself cannot run (missing helper, unsupported kind)
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source: &SourceDescriptor) -> Result<Liveness, ResolveError>;
}

/// Resolver that accepts URL sources as direct playback URLs.
///
/// End of broadcast is detected by the capture process exiting.
#[derive(Debug, Default, Clone)]
pub struct DirectResolver;

#[async_trait]
impl SourceResolver for DirectResolver {
    async fn resolve(&self, source: &SourceDescriptor) -> Result<Liveness, ResolveError> {
        match source {
            SourceDescriptor::Url(url) => Ok(Liveness::Live { url: url.clone() }),
            other => Err(ResolveError::Unavailable(format!(
                "{} sources need a resolver helper (--resolver)",
                other.kind()
            ))),
        }
    }
}

/// One JSON line printed by the helper program
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HelperReply {
    Live {
        url: String,
    },
    Offline,
    NotFound {
        #[serde(default)]
        message: String,
    },
    Error {
        kind: HelperErrorKind,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HelperErrorKind {
    Network,
    Protocol,
}

/// Resolver backed by an external helper: `<program> [args..] <kind> <value>`
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments placed before the kind/value pair
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl SourceResolver for CommandResolver {
    async fn resolve(&self, source: &SourceDescriptor) -> Result<Liveness, ResolveError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source.kind().as_str())
            .arg(source.value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ResolveError::Unavailable(format!("failed to run {}: {}", self.program, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::Protocol(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_helper_reply(&stdout)
    }
}

/// Interpret the helper's stdout (the last non-empty line wins)
pub(crate) fn parse_helper_reply(stdout: &str) -> Result<Liveness, ResolveError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ResolveError::Protocol("empty helper reply".to_string()))?;

    let reply: HelperReply = serde_json::from_str(line)
        .map_err(|e| ResolveError::Protocol(format!("unparseable helper reply: {}", e)))?;

    match reply {
        HelperReply::Live { url } if url.trim().is_empty() => Err(ResolveError::Protocol(
            "helper reported live without a url".to_string(),
        )),
        HelperReply::Live { url } => Ok(Liveness::Live { url }),
        HelperReply::Offline => Ok(Liveness::NotLive),
        HelperReply::NotFound { message } => Err(ResolveError::NotFound(message)),
        HelperReply::Error {
            kind: HelperErrorKind::Network,
            message,
        } => Err(ResolveError::Network(message)),
        HelperReply::Error {
            kind: HelperErrorKind::Protocol,
            message,
        } => Err(ResolveError::Protocol(message)),
    }
}
