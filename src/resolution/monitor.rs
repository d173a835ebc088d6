//! Resolution monitor
//!
//! Runs next to one recording segment. The first successful sample is the
//! baseline; the first sample that differs from it is reported once over a
//! oneshot channel and the monitor exits. The monitor never touches the
//! capture itself, the worker decides what to do with the signal.

use super::probe::{Resolution, ResolutionProbe};
use crate::utils::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Consecutive probe failures after which the source is assumed gone
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// A detected change, relative to the segment's baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionChange {
    pub previous: Resolution,
    pub current: Resolution,
}

/// Why the monitor loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// A change was detected and signalled
    Changed(ResolutionChange),
    /// Too many probe failures in a row; nothing was signalled
    ProbeFailures,
    /// The segment ended
    Stopped,
    /// The receiving worker went away
    Detached,
}

pub struct ResolutionMonitor {
    probe: Arc<dyn ResolutionProbe>,
    live_url: String,
    interval: Duration,
}

impl ResolutionMonitor {
    pub fn new(probe: Arc<dyn ResolutionProbe>, live_url: impl Into<String>, interval: Duration) -> Self {
        Self {
            probe,
            live_url: live_url.into(),
            interval,
        }
    }

    /// Run on a background task until a change, the failure limit, or `stop`.
    ///
    /// The receiver yields the change, or an error if the monitor ended
    /// without one.
    pub fn spawn(self, stop: StopSignal) -> oneshot::Receiver<ResolutionChange> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = self.run(stop, tx).await;
            tracing::debug!("Resolution monitor finished: {:?}", exit);
        });
        rx
    }

    pub async fn run(self, stop: StopSignal, tx: oneshot::Sender<ResolutionChange>) -> MonitorExit {
        let mut baseline: Option<Resolution> = None;
        let mut failures = 0u32;

        loop {
            let sample = tokio::select! {
                biased;
                _ = stop.triggered() => return MonitorExit::Stopped,
                sample = self.probe.sample(&self.live_url) => sample,
            };

            match sample {
                Ok(current) => {
                    failures = 0;
                    match baseline {
                        None => {
                            tracing::debug!("Baseline resolution {}", current);
                            baseline = Some(current);
                        }
                        Some(previous) if previous != current => {
                            tracing::info!("Resolution changed: {} -> {}", previous, current);
                            let change = ResolutionChange { previous, current };
                            if tx.send(change).is_err() {
                                return MonitorExit::Detached;
                            }
                            return MonitorExit::Changed(change);
                        }
                        Some(_) => {}
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Resolution probe failed ({}/{}): {}",
                        failures,
                        MAX_CONSECUTIVE_FAILURES,
                        e
                    );
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::info!("Giving up on resolution checks for this segment");
                        return MonitorExit::ProbeFailures;
                    }
                }
            }

            if tx.is_closed() {
                return MonitorExit::Detached;
            }
            if !stop.sleep(self.interval).await {
                return MonitorExit::Stopped;
            }
        }
    }
}
