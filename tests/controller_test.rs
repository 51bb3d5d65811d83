//! Controller properties over generated action sequences.

use daq_recorder::controller::{spawn_store, update, Action, DeviceState, Effect};
use daq_recorder::core::{
    Capabilities, DeviceKind, DeviceRef, DeviceStatus, Metrics, RecordingStatus, Settings,
};
use daq_recorder::pipeline::RecordingReport;
use daq_recorder::session::RecordingSession;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn caps(produces_frames: bool) -> Capabilities {
    Capabilities {
        hardware_id: "sim".into(),
        modes: vec![],
        controls: vec![],
        produces_frames,
        event_channels: vec![],
        file_extension: if produces_frames { "raw" } else { "csv" }.into(),
    }
}

fn random_action(rng: &mut StdRng, next_id: &mut u32, assignment: u64) -> Action {
    // now and then a result of the previous assignment arrives late
    let generation = if rng.gen_bool(0.2) {
        assignment.saturating_sub(1)
    } else {
        assignment
    };
    let mut id = || {
        *next_id += 1;
        Some(format!("cmd-{}", next_id))
    };
    match rng.gen_range(0..13) {
        0 => Action::AssignDevice {
            device: DeviceRef::new(DeviceKind::Camera, rng.gen_range(0..2)),
            reply_to: id(),
        },
        1 => Action::DeviceAssigned {
            assignment: generation,
            capabilities: caps(true),
        },
        2 => Action::assignment_error(generation, "simulated failure"),
        3 => Action::UnassignDevice { reply_to: id() },
        4 => Action::StartRecording {
            session: RecordingSession::new("/tmp/session", rng.gen_range(1..4)),
            reply_to: id(),
        },
        5 => Action::RecordingStarted,
        6 => Action::StopRecording { reply_to: id() },
        7 => Action::RecordingStopped {
            report: RecordingReport {
                residual: rng.gen_range(0..3),
                ..RecordingReport::default()
            },
        },
        8 => Action::ApplySettings {
            settings: Settings {
                target_rate_hz: if rng.gen_bool(0.2) { -1.0 } else { 60.0 },
                ..Settings::default()
            },
            reply_to: id(),
        },
        9 => Action::SettingsApplied {
            settings: Settings::default(),
        },
        10 => Action::UpdateMetrics(Metrics::default()),
        11 => Action::RecordingFault {
            message: "disk full".into(),
        },
        _ => Action::Shutdown { reply_to: id() },
    }
}

fn replies(effects: &[Effect], counts: &mut HashMap<String, usize>) {
    for effect in effects {
        if let Effect::SendStatus(status) = effect {
            if let Some(id) = &status.in_reply_to {
                *counts.entry(id.clone()).or_default() += 1;
            }
        }
    }
}

#[test]
fn test_generated_sequences_keep_invariants() {
    for seed in 0..300u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut next_id = 0;
        let mut state = DeviceState::new();
        let mut reply_counts = HashMap::new();

        for _ in 0..60 {
            let action = random_action(&mut rng, &mut next_id, state.assignment);
            let was_shut_down = state.shut_down;
            let (next, effects) = update(&state, action);

            assert!(next.invariant_holds(), "seed {}: {:?}", seed, next);
            if was_shut_down {
                assert_eq!(next, state, "seed {}: state changed after shutdown", seed);
                assert!(effects.is_empty());
            }
            if next.recording_status != RecordingStatus::Stopped {
                assert!(next.device.is_some());
            }
            replies(&effects, &mut reply_counts);
            state = next;
        }

        // shutting down answers everything still outstanding
        let (last, effects) = update(&state, Action::Shutdown { reply_to: None });
        replies(&effects, &mut reply_counts);
        assert!(last.pending().is_empty(), "seed {}: replies left pending", seed);
        for (id, count) in &reply_counts {
            assert_eq!(*count, 1, "seed {}: {} answered {} times", seed, id, count);
        }
    }
}

#[test]
fn test_same_kind_devices_never_share_paths() {
    let session = RecordingSession::new("/data/session_7", 2);
    let mut outputs = Vec::new();

    for index in 0..2 {
        let mut state = DeviceState::new();
        for action in [
            Action::AssignDevice {
                device: DeviceRef::new(DeviceKind::Camera, index),
                reply_to: None,
            },
            Action::DeviceAssigned {
                assignment: 1,
                capabilities: caps(true),
            },
            Action::StartRecording {
                session: session.clone(),
                reply_to: None,
            },
        ] {
            state = update(&state, action).0;
        }
        assert_eq!(state.device_status, DeviceStatus::Streaming);
        let paths = state.recording.unwrap();
        outputs.push((paths.output, paths.timing));
    }

    assert_ne!(outputs[0].0, outputs[1].0);
    assert_ne!(outputs[0].1, outputs[1].1);
    assert!(outputs[0].0.ends_with("camera_0/trial_002.raw"));
    assert!(outputs[1].0.ends_with("camera_1/trial_002.raw"));
}

#[test]
fn test_event_only_device_logs_events_as_output() {
    let mut state = DeviceState::new();
    let mut writer = None;
    for action in [
        Action::AssignDevice {
            device: DeviceRef::new(DeviceKind::Gps, 0),
            reply_to: None,
        },
        Action::DeviceAssigned {
            assignment: 1,
            capabilities: caps(false),
        },
        Action::StartRecording {
            session: RecordingSession::new("/data/s", 1),
            reply_to: None,
        },
    ] {
        let (next, effects) = update(&state, action);
        for effect in effects {
            if let Effect::StartWriter(spec) = effect {
                writer = Some(spec);
            }
        }
        state = next;
    }

    let spec = writer.unwrap();
    assert!(!spec.paced);
    assert_eq!(spec.events.as_ref(), Some(&spec.output));
    assert!(spec.output.ends_with("gps_0/trial_001.csv"));
}

#[tokio::test]
async fn test_store_forwards_each_batch_in_order() {
    let (store, mut effects, task) = spawn_store(DeviceState::new(), 8);

    let outcome = store
        .dispatch_with_outcome(Action::AssignDevice {
            device: DeviceRef::new(DeviceKind::Camera, 0),
            reply_to: Some("a1".into()),
        })
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.effect_count, 1);

    let outcome = store
        .dispatch_with_outcome(Action::StopRecording {
            reply_to: Some("s1".into()),
        })
        .await
        .unwrap();
    assert!(!outcome.changed);

    store
        .dispatch_with_outcome(Action::DeviceAssigned {
            assignment: 1,
            capabilities: caps(true),
        })
        .await
        .unwrap();

    let first = effects.recv().await.unwrap();
    assert!(matches!(first.as_slice(), [Effect::ProbeDevice { .. }]));
    let second = effects.recv().await.unwrap();
    assert_eq!(second.len(), 3);
    assert_eq!(store.state().device_status, DeviceStatus::Streaming);

    drop(store);
    task.await.unwrap();
}
