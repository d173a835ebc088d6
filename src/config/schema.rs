//! Settings schema
//!
//! Types for the persisted settings document and for the effective
//! per-job configuration derived from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Key holding the per-kind default inside a kind section
pub const KIND_DEFAULT_KEY: &str = "*";

/// Built-in resolution check interval (seconds)
pub const DEFAULT_RESOLUTION_CHECK_INTERVAL_SECS: u64 = 5;

/// Built-in liveness poll interval for automatic mode (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// How a job finds its broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Record now or fail if the source is not live
    Manual,
    /// Poll until the source goes live, then record
    Automatic,
}

impl Default for RecordingMode {
    fn default() -> Self {
        Self::Manual
    }
}

// =============================================================================
// Persisted document
// =============================================================================

/// One settings block. Every field is optional so that missing values fall
/// through to the next level of the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "restartOnResolutionChange"
    )]
    pub restart_on_resolution_change: Option<bool>,

    /// Seconds between resolution samples
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "resolutionCheckIntervalSeconds"
    )]
    pub resolution_check_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RecordingMode>,

    /// Seconds between liveness polls in automatic mode
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "pollIntervalSeconds"
    )]
    pub poll_interval: Option<u64>,

    /// Session length limit in seconds
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "maxDurationSeconds"
    )]
    pub max_duration: Option<u64>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "outputDirectory"
    )]
    pub output_directory: Option<PathBuf>,
}

impl SourceSettings {
    /// Copy every field set in `patch` over this block
    pub fn merge(&mut self, patch: &SourceSettings) {
        if patch.restart_on_resolution_change.is_some() {
            self.restart_on_resolution_change = patch.restart_on_resolution_change;
        }
        if patch.resolution_check_interval.is_some() {
            self.resolution_check_interval = patch.resolution_check_interval;
        }
        if patch.mode.is_some() {
            self.mode = patch.mode;
        }
        if patch.poll_interval.is_some() {
            self.poll_interval = patch.poll_interval;
        }
        if patch.max_duration.is_some() {
            self.max_duration = patch.max_duration;
        }
        if patch.output_directory.is_some() {
            self.output_directory = patch.output_directory.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SourceSettings::default()
    }
}

/// The settings document: a global default plus one section per kind.
///
/// Kind sections map a source identifier to its override; the reserved key
/// `"*"` holds the per-kind default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub default: SourceSettings,

    #[serde(default)]
    pub users: BTreeMap<String, SourceSettings>,

    #[serde(default)]
    pub rooms: BTreeMap<String, SourceSettings>,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            default: SourceSettings {
                restart_on_resolution_change: Some(false),
                resolution_check_interval: Some(DEFAULT_RESOLUTION_CHECK_INTERVAL_SECS),
                ..SourceSettings::default()
            },
            users: BTreeMap::new(),
            rooms: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Run and job configuration
// =============================================================================

/// Run-wide base values, the last level of the hierarchy
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RecordingMode,
    pub poll_interval: Duration,
    pub max_duration: Option<Duration>,
    pub restart_on_resolution_change: bool,
    pub resolution_check_interval: Duration,
    pub output_directory: PathBuf,
    /// Refuse runs that mix source kinds instead of only warning
    pub exclusive_kinds: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Manual,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_duration: None,
            restart_on_resolution_change: false,
            resolution_check_interval: Duration::from_secs(DEFAULT_RESOLUTION_CHECK_INTERVAL_SECS),
            output_directory: PathBuf::from("."),
            exclusive_kinds: false,
        }
    }
}

/// Effective settings for one job, fixed for the job's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub mode: RecordingMode,
    pub poll_interval: Duration,
    pub max_duration: Option<Duration>,
    pub restart_on_resolution_change: bool,
    pub resolution_check_interval: Duration,
    pub output_directory: PathBuf,
}
