//! Input events consumed by the reducer.

use crate::controller::effect::EffectKind;
use crate::core::{Capabilities, DeviceRef, Metrics, Settings};
use crate::pipeline::RecordingReport;
use crate::session::RecordingSession;

/// Id of the protocol command an action answers to.
pub type CommandId = String;

/// Generation of a device assignment. Every accepted `AssignDevice` starts a
/// new one, so results of an earlier probe can be told apart.
pub type AssignmentId = u64;

/// Something that happened. Immutable, consumed exactly once by `update`.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// User asked to attach a device
    AssignDevice {
        /// Device to probe
        device: DeviceRef,
        /// Command to answer
        reply_to: Option<CommandId>,
    },
    /// Capability probe succeeded
    DeviceAssigned {
        /// Assignment the probe was started for
        assignment: AssignmentId,
        /// Discovered capabilities
        capabilities: Capabilities,
    },
    /// Probe, open or mid-stream failure
    DeviceError {
        /// Human readable reason
        message: String,
        /// Assignment the failing device belongs to; `None` means the current one
        assignment: Option<AssignmentId>,
    },
    /// User asked to detach the device
    UnassignDevice {
        /// Command to answer
        reply_to: Option<CommandId>,
    },
    /// User pressed record
    StartRecording {
        /// Where the outputs go
        session: RecordingSession,
        /// Command to answer
        reply_to: Option<CommandId>,
    },
    /// User pressed stop
    StopRecording {
        /// Command to answer
        reply_to: Option<CommandId>,
    },
    /// Writer and timing log are running
    RecordingStarted,
    /// Pipeline drained (or was force-cancelled)
    RecordingStopped {
        /// Final counters of the recording
        report: RecordingReport,
    },
    /// User supplied new settings
    ApplySettings {
        /// Replacement settings
        settings: Settings,
        /// Command to answer
        reply_to: Option<CommandId>,
    },
    /// Device accepted new settings
    SettingsApplied {
        /// Settings now in effect
        settings: Settings,
    },
    /// Periodic metrics snapshot
    UpdateMetrics(Metrics),
    /// Writes keep failing; recording cannot continue
    RecordingFault {
        /// Human readable reason
        message: String,
    },
    /// An effect finished without a lifecycle consequence
    EffectCompleted(EffectKind),
    /// Unwind everything and stop
    Shutdown {
        /// Command to answer
        reply_to: Option<CommandId>,
    },
}

impl Action {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::AssignDevice { .. } => "AssignDevice",
            Action::DeviceAssigned { .. } => "DeviceAssigned",
            Action::DeviceError { .. } => "DeviceError",
            Action::UnassignDevice { .. } => "UnassignDevice",
            Action::StartRecording { .. } => "StartRecording",
            Action::StopRecording { .. } => "StopRecording",
            Action::RecordingStarted => "RecordingStarted",
            Action::RecordingStopped { .. } => "RecordingStopped",
            Action::ApplySettings { .. } => "ApplySettings",
            Action::SettingsApplied { .. } => "SettingsApplied",
            Action::UpdateMetrics(_) => "UpdateMetrics",
            Action::RecordingFault { .. } => "RecordingFault",
            Action::EffectCompleted(_) => "EffectCompleted",
            Action::Shutdown { .. } => "Shutdown",
        }
    }

    /// Shorthand for a `DeviceError` about the current assignment.
    pub fn device_error(err: impl std::fmt::Display) -> Self {
        Action::DeviceError {
            message: err.to_string(),
            assignment: None,
        }
    }

    /// `DeviceError` raised by the device of a specific assignment.
    pub fn assignment_error(assignment: AssignmentId, err: impl std::fmt::Display) -> Self {
        Action::DeviceError {
            message: err.to_string(),
            assignment: Some(assignment),
        }
    }
}
