//! Resolution change detection
//!
//! - `probe`: samples frame dimensions of a playback URL
//! - `monitor`: polls the probe while a segment records and signals a change

pub mod monitor;
pub mod probe;

pub use monitor::{MonitorExit, ResolutionChange, ResolutionMonitor};
pub use probe::{FfprobeProbe, ProbeError, Resolution, ResolutionProbe};
