//! The pure state transition function.
//!
//! `update` never performs I/O, never reads a clock and never fails. Every
//! `(state, action)` pair has exactly one result; a transition that is not
//! valid in the current state returns the state unchanged with no effects.

use crate::controller::action::{Action, AssignmentId, CommandId};
use crate::controller::effect::{Effect, WriterSpec};
use crate::controller::state::DeviceState;
use crate::core::{Capabilities, DeviceRef, DeviceStatus, Metrics, RecordingStatus, Settings};
use crate::pipeline::RecordingReport;
use crate::protocol::StatusMessage;
use crate::session::{RecordingPaths, RecordingSession};
use serde_json::json;

type Transition = (DeviceState, Vec<Effect>);

/// Apply `action` to `state`.
pub fn update(state: &DeviceState, action: Action) -> Transition {
    if state.shut_down {
        return unchanged(state);
    }

    match action {
        Action::AssignDevice { device, reply_to } => assign_device(state, device, reply_to),
        Action::DeviceAssigned {
            assignment,
            capabilities,
        } => device_assigned(state, assignment, capabilities),
        Action::DeviceError { message, assignment } => device_error(state, message, assignment),
        Action::UnassignDevice { reply_to } => unassign_device(state, reply_to),
        Action::StartRecording { session, reply_to } => start_recording(state, session, reply_to),
        Action::RecordingStarted => recording_started(state),
        Action::StopRecording { reply_to } => stop_recording(state, reply_to),
        Action::RecordingStopped { report } => recording_stopped(state, report),
        Action::ApplySettings { settings, reply_to } => apply_settings(state, settings, reply_to),
        Action::SettingsApplied { settings } => settings_applied(state, settings),
        Action::UpdateMetrics(metrics) => update_metrics(state, metrics),
        Action::RecordingFault { message } => recording_fault(state, message),
        Action::EffectCompleted(_) => unchanged(state),
        Action::Shutdown { reply_to } => shutdown(state, reply_to),
    }
}

fn unchanged(state: &DeviceState) -> Transition {
    (state.clone(), vec![])
}

fn send(status: StatusMessage) -> Effect {
    Effect::SendStatus(status)
}

fn cancel_pending(next: &mut DeviceState, reason: &str, effects: &mut Vec<Effect>) {
    for id in next.pending.drain() {
        effects.push(send(StatusMessage::error(Some(id), reason)));
    }
}

fn recording_paths_json(paths: &RecordingPaths) -> serde_json::Value {
    json!({
        "output": paths.output,
        "timing": paths.timing,
    })
}

fn assign_device(state: &DeviceState, device: DeviceRef, reply_to: Option<CommandId>) -> Transition {
    if state.device_status != DeviceStatus::Idle {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.device_status = DeviceStatus::Assigning;
    next.device = Some(device);
    next.capabilities = None;
    next.last_error = None;
    next.pending.assign = reply_to;
    next.assignment = state.assignment.wrapping_add(1);

    let probe = Effect::ProbeDevice {
        device,
        assignment: next.assignment,
    };
    (next, vec![probe])
}

fn device_assigned(
    state: &DeviceState,
    assignment: AssignmentId,
    capabilities: Capabilities,
) -> Transition {
    let device = match (state.device_status, state.device) {
        (DeviceStatus::Assigning, Some(device)) if assignment == state.assignment => device,
        _ => return unchanged(state),
    };

    let mut next = state.clone();
    next.device_status = DeviceStatus::Streaming;
    let reply_to = next.pending.assign.take();
    let status = StatusMessage::reply(format!("{}_assigned", device.kind.slug()), reply_to)
        .with_data(json!({
            "device_id": capabilities.hardware_id,
            "device": device.slug(),
            "capabilities": capabilities,
        }));
    next.capabilities = Some(capabilities);

    let effects = vec![
        Effect::OpenDevice {
            device,
            assignment,
            settings: state.settings.clone(),
        },
        Effect::StartCapture,
        send(status),
    ];
    (next, effects)
}

fn device_error(
    state: &DeviceState,
    message: String,
    assignment: Option<AssignmentId>,
) -> Transition {
    // Reports about a released device or an earlier assignment refer to nothing.
    if state.device_status == DeviceStatus::Idle
        || assignment.is_some_and(|a| a != state.assignment)
    {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.device_status = DeviceStatus::Error;
    next.last_error = Some(message.clone());

    let mut effects = Vec::new();
    match state.recording_status {
        RecordingStatus::Starting | RecordingStatus::Recording => {
            next.recording_status = RecordingStatus::Stopping;
            effects.extend([Effect::StopWriter, Effect::StopTimingLog, Effect::StopCapture]);
        }
        RecordingStatus::Stopping => effects.push(Effect::StopCapture),
        RecordingStatus::Stopped => {}
    }

    if next.pending.is_empty() {
        effects.push(send(StatusMessage::reply("error", None).with_data(json!({
            "message": message,
            "device": state.device.map(|d| d.slug()),
        }))));
    } else {
        cancel_pending(&mut next, &message, &mut effects);
    }

    (next, effects)
}

fn unassign_device(state: &DeviceState, reply_to: Option<CommandId>) -> Transition {
    if state.device_status == DeviceStatus::Idle {
        return unchanged(state);
    }

    let mut effects = Vec::new();
    if matches!(
        state.recording_status,
        RecordingStatus::Starting | RecordingStatus::Recording
    ) {
        effects.extend([Effect::StopWriter, Effect::StopTimingLog]);
    }
    effects.extend([Effect::StopCapture, Effect::CloseDevice]);

    let mut next = DeviceState {
        settings: state.settings.clone(),
        last_report: state.last_report.clone(),
        pending: state.pending.clone(),
        assignment: state.assignment,
        ..DeviceState::default()
    };
    cancel_pending(&mut next, "cancelled: device unassigned", &mut effects);

    let status = StatusMessage::reply("device_unassigned", reply_to)
        .with_data(json!({ "device": state.device.map(|d| d.slug()) }));
    effects.push(send(status));

    (next, effects)
}

fn start_recording(
    state: &DeviceState,
    session: RecordingSession,
    reply_to: Option<CommandId>,
) -> Transition {
    // Recording starts with settings that are no longer in flight.
    if state.device_status != DeviceStatus::Streaming
        || state.recording_status != RecordingStatus::Stopped
        || state.pending.settings.is_some()
    {
        return unchanged(state);
    }
    let (device, capabilities) = match (&state.device, &state.capabilities) {
        (Some(device), Some(capabilities)) => (device, capabilities),
        _ => return unchanged(state),
    };

    let paths = RecordingPaths::for_device(&session, device, &capabilities.file_extension);
    // Event-only devices record their events as the primary output.
    let events = if !capabilities.produces_frames {
        Some(paths.output.clone())
    } else if !capabilities.event_channels.is_empty() {
        Some(paths.events.clone())
    } else {
        None
    };
    let writer = WriterSpec {
        output: paths.output.clone(),
        events,
        rate_hz: state.settings.record_rate(),
        paced: capabilities.produces_frames,
    };

    let mut next = state.clone();
    next.recording_status = RecordingStatus::Starting;
    next.pending.start = reply_to;
    let effects = vec![
        Effect::StartWriter(writer),
        Effect::StartTimingLog(paths.timing.clone()),
    ];
    next.recording = Some(paths);

    (next, effects)
}

fn recording_started(state: &DeviceState) -> Transition {
    if state.recording_status != RecordingStatus::Starting
        || state.device_status != DeviceStatus::Streaming
    {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.recording_status = RecordingStatus::Recording;
    let mut status = StatusMessage::reply("recording_started", next.pending.start.take());
    if let Some(paths) = &next.recording {
        status = status.with_data(recording_paths_json(paths));
    }

    (next, vec![send(status)])
}

fn stop_recording(state: &DeviceState, reply_to: Option<CommandId>) -> Transition {
    if state.recording_status != RecordingStatus::Recording {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.recording_status = RecordingStatus::Stopping;
    next.pending.stop = reply_to;

    (next, vec![Effect::StopWriter, Effect::StopTimingLog])
}

fn recording_stopped(state: &DeviceState, report: RecordingReport) -> Transition {
    if state.recording_status != RecordingStatus::Stopping {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.recording_status = RecordingStatus::Stopped;
    next.recording = None;

    let mut effects = vec![send(
        StatusMessage::reply("recording_stopped", next.pending.stop.take())
            .with_data(json!({ "report": report })),
    )];
    if report.residual > 0 {
        effects.push(send(StatusMessage::new("warning").with_data(json!({
            "message": format!(
                "recording incomplete: {} queued item(s) cancelled after drain timeout",
                report.residual
            ),
            "residual": report.residual,
            "output": report.output,
        }))));
    }
    next.last_report = Some(report);

    (next, effects)
}

fn apply_settings(state: &DeviceState, settings: Settings, reply_to: Option<CommandId>) -> Transition {
    if !settings.is_valid() {
        return (
            state.clone(),
            vec![send(StatusMessage::error(
                reply_to,
                "invalid settings: rates must be finite and positive",
            ))],
        );
    }

    match (state.device_status, state.recording_status) {
        (DeviceStatus::Idle, _) => {
            let mut next = state.clone();
            let status = StatusMessage::reply("settings_applied", reply_to)
                .with_data(json!({ "settings": settings }));
            next.settings = settings;
            (next, vec![send(status)])
        }
        (DeviceStatus::Streaming, RecordingStatus::Stopped) if state.pending.settings.is_none() => {
            let mut next = state.clone();
            next.pending.settings = reply_to;
            (next, vec![Effect::ApplyDeviceSettings(settings)])
        }
        _ => unchanged(state),
    }
}

fn settings_applied(state: &DeviceState, settings: Settings) -> Transition {
    if state.device_status != DeviceStatus::Streaming
        || state.recording_status != RecordingStatus::Stopped
    {
        return unchanged(state);
    }

    let mut next = state.clone();
    let status = StatusMessage::reply("settings_applied", next.pending.settings.take())
        .with_data(json!({ "settings": settings }));
    next.settings = settings;

    (next, vec![send(status)])
}

fn update_metrics(state: &DeviceState, metrics: Metrics) -> Transition {
    if state.device_status == DeviceStatus::Idle {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.metrics = metrics;
    (next, vec![])
}

fn recording_fault(state: &DeviceState, message: String) -> Transition {
    if !matches!(
        state.recording_status,
        RecordingStatus::Starting | RecordingStatus::Recording
    ) {
        return unchanged(state);
    }

    let mut next = state.clone();
    next.recording_status = RecordingStatus::Stopping;

    let mut effects = vec![Effect::StopWriter, Effect::StopTimingLog];
    if let Some(id) = next.pending.start.take() {
        effects.push(send(StatusMessage::error(Some(id), message.clone())));
    }
    effects.push(send(StatusMessage::reply("error", None).with_data(json!({
        "message": message,
        "device": state.device.map(|d| d.slug()),
        "recording": "stopped",
    }))));

    (next, effects)
}

fn shutdown(state: &DeviceState, reply_to: Option<CommandId>) -> Transition {
    let mut effects = Vec::new();
    if matches!(
        state.recording_status,
        RecordingStatus::Starting | RecordingStatus::Recording
    ) {
        effects.extend([Effect::StopWriter, Effect::StopTimingLog]);
    }
    if state.device_status != DeviceStatus::Idle {
        effects.extend([Effect::StopCapture, Effect::CloseDevice]);
    }
    effects.push(Effect::CleanupResources);

    let mut next = DeviceState {
        settings: state.settings.clone(),
        last_report: state.last_report.clone(),
        pending: state.pending.clone(),
        assignment: state.assignment,
        shut_down: true,
        ..DeviceState::default()
    };
    cancel_pending(&mut next, "cancelled: shutting down", &mut effects);
    effects.push(send(StatusMessage::reply("shutdown", reply_to)));

    (next, effects)
}
