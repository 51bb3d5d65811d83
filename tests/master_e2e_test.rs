//! Master driving real `daq_module` processes.

use daq_recorder::config::ModuleSpec;
use daq_recorder::master::{ExitOutcome, Master};
use daq_recorder::protocol::CommandMessage;
use std::path::PathBuf;
use std::time::Duration;

fn module(name: &str, kind: &str, device_index: u32) -> ModuleSpec {
    ModuleSpec {
        name: name.into(),
        program: PathBuf::from(env!("CARGO_BIN_EXE_daq_module")),
        args: vec![
            "--kind".into(),
            kind.into(),
            "--log-level".into(),
            "warn".into(),
        ],
        device_index,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_cameras_record_one_trial_into_separate_files() {
    let session = tempfile::tempdir().unwrap();
    let mut master = Master::new(Duration::from_secs(10));
    master.launch(&module("cam_a", "camera", 0)).unwrap();
    master.launch(&module("cam_b", "camera", 1)).unwrap();
    assert_eq!(master.module_names(), vec!["cam_a", "cam_b"]);

    for (name, index) in [("cam_a", 0), ("cam_b", 1)] {
        let reply = master
            .send(
                name,
                CommandMessage::new("assign_device").with_param("device_index", index),
            )
            .await
            .unwrap();
        assert_eq!(reply.status, "camera_assigned");
    }

    let start = CommandMessage::new("start_recording")
        .with_param("session_dir", session.path().to_string_lossy().into_owned())
        .with_param("trial_number", 1);
    let mut outputs = Vec::new();
    for (_, reply) in master.broadcast(start).await {
        let reply = reply.unwrap();
        assert_eq!(reply.status, "recording_started");
        outputs.push(reply.data.unwrap()["output"].as_str().unwrap().to_string());
    }
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);

    tokio::time::sleep(Duration::from_millis(400)).await;

    for (_, reply) in master.broadcast(CommandMessage::new("stop_recording")).await {
        let reply = reply.unwrap();
        assert_eq!(reply.status, "recording_stopped");
        assert!(reply.data.unwrap()["report"]["written"].as_u64().unwrap() > 0);
    }

    for output in &outputs {
        assert!(std::fs::metadata(output).unwrap().len() > 0);
    }
    assert!(session.path().join("camera_0/trial_001_timing.csv").exists());
    assert!(session.path().join("camera_1/trial_001_timing.csv").exists());

    let outcomes = master.shutdown(Duration::from_secs(5)).await;
    assert_eq!(outcomes.len(), 2);
    for (name, outcome) in outcomes {
        match outcome {
            ExitOutcome::Exited(status) => assert!(status.success(), "{} exited with {}", name, status),
            other => panic!("{} did not exit on its own: {:?}", name, other),
        }
    }
}

#[tokio::test]
async fn test_module_answers_after_failed_assign() {
    let mut master = Master::new(Duration::from_secs(10));
    let mut spec = module("cam", "camera", 0);
    spec.args.push("--sim-fail-probe".into());
    master.launch(&spec).unwrap();

    let reply = master
        .send("cam", CommandMessage::new("assign_device"))
        .await
        .unwrap();
    assert!(reply.is_error());

    let reply = master.send("cam", CommandMessage::new("ping")).await.unwrap();
    assert_eq!(reply.status, "pong");

    master.shutdown(Duration::from_secs(5)).await;
}
