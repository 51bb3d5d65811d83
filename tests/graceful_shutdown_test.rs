//! Tests for graceful shutdown with timeout behavior.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use daq_recorder::config::RecorderConfig;
use daq_recorder::core::{Capabilities, Capture, DeviceKind, DeviceRef, Sample, Settings};
use daq_recorder::device::{DeviceDriver, DeviceHandle, SimulatedConfig, SimulatedDriver};
use daq_recorder::error::AppResult;
use daq_recorder::module::DeviceModule;
use daq_recorder::protocol::{decode_status, encode_line, CommandMessage, StatusMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Camera whose close takes a while and is counted.
struct SlowCloseDriver {
    closes: Arc<AtomicUsize>,
}

struct SlowCloseHandle {
    sequence: u64,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl DeviceDriver for SlowCloseDriver {
    async fn probe(&self, _device: DeviceRef) -> AppResult<Capabilities> {
        Ok(Capabilities {
            hardware_id: "slow-close".into(),
            modes: vec![],
            controls: vec![],
            produces_frames: true,
            event_channels: vec![],
            file_extension: "raw".into(),
        })
    }

    async fn open(&self, _device: DeviceRef, _settings: &Settings) -> AppResult<Box<dyn DeviceHandle>> {
        Ok(Box::new(SlowCloseHandle {
            sequence: 0,
            closes: self.closes.clone(),
        }))
    }
}

impl DeviceHandle for SlowCloseHandle {
    fn read_sample(&mut self) -> AppResult<Option<Capture>> {
        std::thread::sleep(Duration::from_millis(10));
        self.sequence += 1;
        Ok(Some(Capture::Frame(Sample {
            sequence: self.sequence,
            captured_at: Utc::now(),
            payload: Bytes::from_static(b"frame"),
        })))
    }

    fn apply_settings(&mut self, _settings: &Settings) -> AppResult<()> {
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        std::thread::sleep(Duration::from_millis(200));
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn send(writer: &mut tokio::io::DuplexStream, command: CommandMessage) {
    writer
        .write_all(encode_line(&command).unwrap().as_bytes())
        .await
        .unwrap();
}

async fn wait_for<R>(lines: &mut tokio::io::Lines<R>, predicate: impl Fn(&StatusMessage) -> bool) -> StatusMessage
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("status within 5s")
            .unwrap()
            .expect("status stream open");
        let status = decode_status(&line).unwrap();
        if predicate(&status) {
            return status;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_while_recording_is_graceful() {
    let dir = tempfile::tempdir().unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let (mut commands, module_in) = tokio::io::duplex(16 * 1024);
    let (module_out, statuses) = tokio::io::duplex(16 * 1024);
    let mut lines = BufReader::new(statuses).lines();

    let module = tokio::spawn(
        DeviceModule::new(
            DeviceKind::Camera,
            Arc::new(SlowCloseDriver {
                closes: closes.clone(),
            }),
            RecorderConfig::default(),
        )
        .run(module_in, module_out),
    );

    send(&mut commands, CommandMessage::new("assign_device").with_id("a1")).await;
    wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("a1")).await;
    send(
        &mut commands,
        CommandMessage::new("start_recording")
            .with_id("s1")
            .with_param("session_dir", dir.path().to_string_lossy().into_owned())
            .with_param("trial_number", 1),
    )
    .await;
    let started = wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("s1")).await;
    assert_eq!(started.status, "recording_started");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = std::time::Instant::now();
    send(&mut commands, CommandMessage::new("shutdown").with_id("q1")).await;
    let reply = wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("q1")).await;
    assert_eq!(reply.status, "shutdown");
    module.await.unwrap().unwrap();
    let elapsed = start.elapsed();

    // Should complete well inside the module's shutdown timeout
    assert!(
        elapsed < Duration::from_secs(5),
        "Graceful shutdown took too long: {:?}",
        elapsed
    );
    // The shutdown reply is only sent once the device has been released
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let timing = dir.path().join("camera_0").join("trial_001_timing.csv");
    let rows = std::fs::read_to_string(timing).unwrap().lines().count();
    assert!(rows > 1, "timing log should hold the recorded rows");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_device_stops_recording_and_module_still_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let (mut commands, module_in) = tokio::io::duplex(16 * 1024);
    let (module_out, statuses) = tokio::io::duplex(16 * 1024);
    let mut lines = BufReader::new(statuses).lines();

    let driver = SimulatedDriver::new(SimulatedConfig {
        lose_after: Some(30),
        probe_delay: Duration::from_millis(1),
        ..SimulatedConfig::default()
    });
    let module = tokio::spawn(
        DeviceModule::new(DeviceKind::Camera, Arc::new(driver), RecorderConfig::default())
            .run(module_in, module_out),
    );

    send(&mut commands, CommandMessage::new("assign_device").with_id("a1")).await;
    wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("a1")).await;
    send(
        &mut commands,
        CommandMessage::new("start_recording")
            .with_id("s1")
            .with_param("session_dir", dir.path().to_string_lossy().into_owned())
            .with_param("trial_number", 2),
    )
    .await;

    // about one second of capture at 30 Hz before the device disappears
    let error = wait_for(&mut lines, |s| s.is_error() && s.in_reply_to.is_none()).await;
    assert!(error.data.unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("stopped responding"));
    let stopped = wait_for(&mut lines, |s| s.status == "recording_stopped").await;
    assert!(stopped.data.unwrap()["report"]["written"].as_u64().unwrap() > 0);

    send(&mut commands, CommandMessage::new("get_status").with_id("g1")).await;
    let status = wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("g1")).await;
    let state = status.data.unwrap();
    assert_eq!(state["device_status"], "error");
    assert_eq!(state["recording_status"], "stopped");

    send(&mut commands, CommandMessage::new("shutdown").with_id("q1")).await;
    wait_for(&mut lines, |s| s.in_reply_to.as_deref() == Some("q1")).await;
    tokio::time::timeout(Duration::from_secs(6), module)
        .await
        .expect("module stops")
        .unwrap()
        .unwrap();
}
