//! Outbound commands requested by the reducer.
//!
//! Effects carry every piece of data the executor needs, so the executor never
//! has to read controller state.

use crate::controller::action::AssignmentId;
use crate::core::{DeviceRef, Settings};
use crate::protocol::StatusMessage;
use std::path::PathBuf;

/// Everything `StartWriter` needs to bring a pipeline up.
#[derive(Clone, Debug, PartialEq)]
pub struct WriterSpec {
    /// Media output file
    pub output: PathBuf,
    /// Event log file, when the device has event channels
    pub events: Option<PathBuf>,
    /// Pacing rate for the media stream
    pub rate_hz: f64,
    /// Whether a paced media stream is recorded at all
    pub paced: bool,
}

/// A side effect the executor must perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Discover capabilities
    ProbeDevice {
        /// Device to probe
        device: DeviceRef,
        /// Assignment the result belongs to
        assignment: AssignmentId,
    },
    /// Open the device with the given settings
    OpenDevice {
        /// Device to open
        device: DeviceRef,
        /// Assignment the opened device belongs to
        assignment: AssignmentId,
        /// Initial settings
        settings: Settings,
    },
    /// Close the device handle
    CloseDevice,
    /// Start the capture thread feeding the mailbox
    StartCapture,
    /// Stop the capture thread
    StopCapture,
    /// Open the output sink
    StartWriter(WriterSpec),
    /// Stop pacer, drain writer
    StopWriter,
    /// Open the timing log and start the pipeline
    StartTimingLog(PathBuf),
    /// Flush and close the timing log
    StopTimingLog,
    /// Push settings to the device
    ApplyDeviceSettings(Settings),
    /// Emit a status line to the master
    SendStatus(StatusMessage),
    /// Release whatever is left and signal shutdown completion
    CleanupResources,
}

/// Fieldless mirror of [`Effect`] used to acknowledge completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// See [`Effect::ProbeDevice`]
    ProbeDevice,
    /// See [`Effect::OpenDevice`]
    OpenDevice,
    /// See [`Effect::CloseDevice`]
    CloseDevice,
    /// See [`Effect::StartCapture`]
    StartCapture,
    /// See [`Effect::StopCapture`]
    StopCapture,
    /// See [`Effect::StartWriter`]
    StartWriter,
    /// See [`Effect::StopWriter`]
    StopWriter,
    /// See [`Effect::StartTimingLog`]
    StartTimingLog,
    /// See [`Effect::StopTimingLog`]
    StopTimingLog,
    /// See [`Effect::ApplyDeviceSettings`]
    ApplyDeviceSettings,
    /// See [`Effect::SendStatus`]
    SendStatus,
    /// See [`Effect::CleanupResources`]
    CleanupResources,
}

impl Effect {
    /// The fieldless kind of this effect.
    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::ProbeDevice { .. } => EffectKind::ProbeDevice,
            Effect::OpenDevice { .. } => EffectKind::OpenDevice,
            Effect::CloseDevice => EffectKind::CloseDevice,
            Effect::StartCapture => EffectKind::StartCapture,
            Effect::StopCapture => EffectKind::StopCapture,
            Effect::StartWriter(_) => EffectKind::StartWriter,
            Effect::StopWriter => EffectKind::StopWriter,
            Effect::StartTimingLog(_) => EffectKind::StartTimingLog,
            Effect::StopTimingLog => EffectKind::StopTimingLog,
            Effect::ApplyDeviceSettings(_) => EffectKind::ApplyDeviceSettings,
            Effect::SendStatus(_) => EffectKind::SendStatus,
            Effect::CleanupResources => EffectKind::CleanupResources,
        }
    }

    /// Unwind effects always run, even after an earlier effect of the same
    /// batch failed.
    pub fn is_unwind(&self) -> bool {
        matches!(
            self,
            Effect::StopWriter
                | Effect::StopTimingLog
                | Effect::StopCapture
                | Effect::CloseDevice
                | Effect::CleanupResources
        )
    }
}
