//! Recording session and the output path contract.
//!
//! Every recording lands at
//!
//! ```text
//! <session_dir>/<kind>_<index>/trial_<NNN>.<ext>
//! <session_dir>/<kind>_<index>/trial_<NNN>_timing.csv
//! <session_dir>/<kind>_<index>/trial_<NNN>_events.csv
//! ```
//!
//! The per-device directory carries the device index, so two devices of the
//! same kind recording the same trial into the same session never share a file.

use crate::core::DeviceRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Externally supplied identifiers scoping where a recording is written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSession {
    /// Session root directory
    pub session_dir: PathBuf,
    /// Trial number within the session
    pub trial_number: u32,
}

impl RecordingSession {
    /// Create a new recording session
    pub fn new(session_dir: impl Into<PathBuf>, trial_number: u32) -> Self {
        Self {
            session_dir: session_dir.into(),
            trial_number,
        }
    }

    /// `trial_001` style stem.
    pub fn trial_stem(&self) -> String {
        format!("trial_{:03}", self.trial_number)
    }
}

/// All files one device writes for one trial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingPaths {
    /// Per-device directory
    pub device_dir: PathBuf,
    /// Recorded media stream
    pub output: PathBuf,
    /// Per-item timing diagnostics
    pub timing: PathBuf,
    /// Secondary event stream log
    pub events: PathBuf,
}

impl RecordingPaths {
    /// Compute the paths for `device` in `session`. Pure: creates nothing.
    pub fn for_device(session: &RecordingSession, device: &DeviceRef, extension: &str) -> Self {
        let device_dir = session.session_dir.join(device.slug());
        let stem = session.trial_stem();
        let extension = extension.trim_start_matches('.');

        Self {
            output: device_dir.join(format!("{}.{}", stem, extension)),
            timing: device_dir.join(format!("{}_timing.csv", stem)),
            events: device_dir.join(format!("{}_events.csv", stem)),
            device_dir,
        }
    }

    /// Directory that must exist before any file is opened.
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }
}
