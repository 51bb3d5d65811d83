//! Controller state owned by the store.

use crate::controller::action::{AssignmentId, CommandId};
use crate::core::{Capabilities, DeviceRef, DeviceStatus, Metrics, RecordingStatus, Settings};
use crate::pipeline::RecordingReport;
use crate::session::RecordingPaths;
use serde::Serialize;

/// Command ids waiting for the transition that completes them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingReplies {
    /// `assign_device` waiting for `DeviceAssigned`
    pub assign: Option<CommandId>,
    /// `start_recording` waiting for `RecordingStarted`
    pub start: Option<CommandId>,
    /// `stop_recording` waiting for `RecordingStopped`
    pub stop: Option<CommandId>,
    /// `apply_settings` waiting for `SettingsApplied`
    pub settings: Option<CommandId>,
}

impl PendingReplies {
    /// Take every pending id, leaving the slots empty.
    pub fn drain(&mut self) -> Vec<CommandId> {
        [
            self.assign.take(),
            self.start.take(),
            self.stop.take(),
            self.settings.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// True when no command is waiting.
    pub fn is_empty(&self) -> bool {
        self.assign.is_none()
            && self.start.is_none()
            && self.stop.is_none()
            && self.settings.is_none()
    }
}

/// Full controller state. Only `update` produces new values of it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceState {
    /// Device lifecycle
    pub device_status: DeviceStatus,
    /// Recording lifecycle
    pub recording_status: RecordingStatus,
    /// Assigned device
    pub device: Option<DeviceRef>,
    /// Settings in effect
    pub settings: Settings,
    /// Capabilities of the assigned device
    pub capabilities: Option<Capabilities>,
    /// Latest metrics snapshot
    pub metrics: Metrics,
    /// Paths of the active recording
    pub recording: Option<RecordingPaths>,
    /// Report of the last finished recording
    pub last_report: Option<RecordingReport>,
    /// Last device error
    pub last_error: Option<String>,
    /// Set once `Shutdown` was applied; every later action is a no-op
    pub shut_down: bool,
    /// Generation of the latest assignment
    #[serde(skip)]
    pub assignment: AssignmentId,
    #[serde(skip)]
    pub(crate) pending: PendingReplies,
}

impl DeviceState {
    /// Fresh state at process start.
    pub fn new() -> Self {
        Self::default()
    }

    /// State at process start with preloaded settings.
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Commands still waiting for a reply.
    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }

    /// `recording_status == Recording` implies `device_status == Streaming`.
    pub fn invariant_holds(&self) -> bool {
        self.recording_status != RecordingStatus::Recording
            || self.device_status == DeviceStatus::Streaming
    }
}
