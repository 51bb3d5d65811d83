//! Synthetic devices with an irregular capture cadence.
use crate::core::{
    Capabilities, Capture, DeviceKind, DeviceMode, DeviceRef, EventRecord, Resolution, Sample,
    Settings,
};
use crate::device::{DeviceDriver, DeviceHandle};
use crate::error::{AppResult, RecorderError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info};

/// A one-off pause in capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulatedGap {
    /// Samples delivered before the pause
    pub after: u64,
    /// Length of the pause
    pub duration: Duration,
}

/// Behaviour of the simulated hardware.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedConfig {
    /// Number of devices "attached"; probing a higher index fails
    pub available: u32,
    /// Relative jitter of the capture interval (0.2 = ±20%)
    pub jitter: f64,
    /// Bytes per media sample
    pub payload_size: usize,
    /// Optional capture pause
    pub gap: Option<SimulatedGap>,
    /// Make every probe fail
    pub fail_probe: bool,
    /// Make every open fail
    pub fail_open: bool,
    /// Report the device as lost after this many reads
    pub lose_after: Option<u64>,
    /// Probe latency
    pub probe_delay: Duration,
    /// Seed for reproducible jitter
    pub seed: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            available: 2,
            jitter: 0.2,
            payload_size: 64,
            gap: None,
            fail_probe: false,
            fail_open: false,
            lose_after: None,
            probe_delay: Duration::from_millis(5),
            seed: None,
        }
    }
}

/// Driver producing synthetic frames and events.
#[derive(Clone, Debug, Default)]
pub struct SimulatedDriver {
    config: SimulatedConfig,
}

impl SimulatedDriver {
    /// Create a new simulated driver
    pub fn new(config: SimulatedConfig) -> Self {
        Self { config }
    }

    fn capabilities(device: DeviceRef) -> Capabilities {
        let mode = |width, height, max_rate_hz| DeviceMode {
            resolution: Some(Resolution { width, height }),
            max_rate_hz,
        };
        let hardware_id = format!("sim-{}", device.slug());

        match device.kind {
            DeviceKind::Camera => Capabilities {
                hardware_id,
                modes: vec![mode(640, 480, 60.0), mode(1280, 720, 30.0)],
                controls: vec!["exposure".into(), "gain".into()],
                produces_frames: true,
                event_channels: vec![],
                file_extension: "raw".into(),
            },
            DeviceKind::Audio => Capabilities {
                hardware_id,
                modes: vec![DeviceMode {
                    resolution: None,
                    max_rate_hz: 100.0,
                }],
                controls: vec!["sample_rate".into(), "gain".into()],
                produces_frames: true,
                event_channels: vec![],
                file_extension: "pcm".into(),
            },
            DeviceKind::EyeTracker => Capabilities {
                hardware_id,
                modes: vec![mode(1088, 1080, 30.0)],
                controls: vec![],
                produces_frames: true,
                event_channels: vec!["gaze".into(), "imu".into()],
                file_extension: "raw".into(),
            },
            DeviceKind::Gps => Capabilities {
                hardware_id,
                modes: vec![DeviceMode {
                    resolution: None,
                    max_rate_hz: 10.0,
                }],
                controls: vec![],
                produces_frames: false,
                event_channels: vec!["fix".into()],
                file_extension: "csv".into(),
            },
            DeviceKind::TaskEvents => Capabilities {
                hardware_id,
                modes: vec![],
                controls: vec![],
                produces_frames: false,
                event_channels: vec!["task".into()],
                file_extension: "csv".into(),
            },
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn probe(&self, device: DeviceRef) -> AppResult<Capabilities> {
        tokio::time::sleep(self.config.probe_delay).await;
        if self.config.fail_probe {
            return Err(RecorderError::Probe(format!("{} did not respond", device)));
        }
        if device.index >= self.config.available {
            return Err(RecorderError::Probe(format!(
                "no {} at index {} ({} attached)",
                device.kind, device.index, self.config.available
            )));
        }
        debug!(device = %device, "Probed simulated device");
        Ok(Self::capabilities(device))
    }

    async fn open(&self, device: DeviceRef, settings: &Settings) -> AppResult<Box<dyn DeviceHandle>> {
        if self.config.fail_open {
            return Err(RecorderError::DeviceOpen(format!("{} is busy", device)));
        }
        info!(device = %device, rate_hz = settings.target_rate_hz, "Opened simulated device");

        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Box::new(SimulatedHandle {
            device,
            config: self.config.clone(),
            rate_hz: settings.target_rate_hz,
            rng,
            reads: 0,
            gap_done: false,
            closed: false,
        }))
    }
}

struct SimulatedHandle {
    device: DeviceRef,
    config: SimulatedConfig,
    rate_hz: f64,
    rng: StdRng,
    reads: u64,
    gap_done: bool,
    closed: bool,
}

impl SimulatedHandle {
    fn next_interval(&mut self) -> Duration {
        let base = 1.0 / self.rate_hz;
        let jitter = self.config.jitter.clamp(0.0, 0.9);
        let factor = if jitter > 0.0 {
            self.rng.gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(base * factor)
    }

    fn event(&mut self, channel: &str) -> EventRecord {
        let values = match channel {
            "gaze" => vec![self.rng.gen_range(0.0..1088.0), self.rng.gen_range(0.0..1080.0)],
            "imu" => (0..6).map(|_| self.rng.gen_range(-1.0..1.0)).collect(),
            "fix" => vec![
                52.0 + self.rng.gen_range(-1e-4..1e-4),
                4.9 + self.rng.gen_range(-1e-4..1e-4),
                self.rng.gen_range(0.0..3.0),
            ],
            _ => vec![self.reads as f64],
        };
        EventRecord {
            channel: channel.to_string(),
            captured_at: Utc::now(),
            values,
        }
    }
}

impl DeviceHandle for SimulatedHandle {
    fn read_sample(&mut self) -> AppResult<Option<Capture>> {
        if self.closed {
            return Err(RecorderError::DeviceNotOpen);
        }
        if let Some(limit) = self.config.lose_after {
            if self.reads >= limit {
                return Err(RecorderError::DeviceLost(format!(
                    "{} stopped responding",
                    self.device
                )));
            }
        }

        std::thread::sleep(self.next_interval());
        if let Some(gap) = self.config.gap {
            if !self.gap_done && self.reads >= gap.after {
                self.gap_done = true;
                std::thread::sleep(gap.duration);
            }
        }

        let sequence = self.reads;
        self.reads += 1;

        let capture = match self.device.kind {
            DeviceKind::Camera | DeviceKind::Audio => Capture::Frame(Sample {
                sequence,
                captured_at: Utc::now(),
                payload: Bytes::from(vec![(sequence % 251) as u8; self.config.payload_size]),
            }),
            // scene frames interleaved with gaze and imu records
            DeviceKind::EyeTracker => match sequence % 3 {
                0 => Capture::Frame(Sample {
                    sequence: sequence / 3,
                    captured_at: Utc::now(),
                    payload: Bytes::from(vec![0x7f; self.config.payload_size]),
                }),
                1 => Capture::Event(self.event("gaze")),
                _ => Capture::Event(self.event("imu")),
            },
            DeviceKind::Gps => Capture::Event(self.event("fix")),
            DeviceKind::TaskEvents => Capture::Event(self.event("task")),
        };
        Ok(Some(capture))
    }

    fn apply_settings(&mut self, settings: &Settings) -> AppResult<()> {
        if !settings.is_valid() {
            return Err(RecorderError::Configuration(
                "simulated device rejected settings".into(),
            ));
        }
        self.rate_hz = settings.target_rate_hz;
        debug!(device = %self.device, rate_hz = self.rate_hz, "Applied settings");
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if !self.closed {
            self.closed = true;
            info!(device = %self.device, reads = self.reads, "Closed simulated device");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> SimulatedConfig {
        SimulatedConfig {
            probe_delay: Duration::ZERO,
            seed: Some(7),
            ..SimulatedConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_respects_available_devices() {
        let driver = SimulatedDriver::new(quick());
        let caps = driver
            .probe(DeviceRef::new(DeviceKind::Camera, 1))
            .await
            .unwrap();
        assert_eq!(caps.hardware_id, "sim-camera_1");
        assert!(caps.produces_frames);

        let err = driver
            .probe(DeviceRef::new(DeviceKind::Camera, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::Probe(_)));
    }

    #[tokio::test]
    async fn test_injected_probe_failure() {
        let driver = SimulatedDriver::new(SimulatedConfig {
            fail_probe: true,
            ..quick()
        });
        assert!(driver.probe(DeviceRef::new(DeviceKind::Gps, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_reads_until_lost() {
        let driver = SimulatedDriver::new(SimulatedConfig {
            lose_after: Some(2),
            ..quick()
        });
        let settings = Settings {
            target_rate_hz: 500.0,
            ..Settings::default()
        };
        let mut handle = driver
            .open(DeviceRef::new(DeviceKind::Camera, 0), &settings)
            .await
            .unwrap();
        assert!(matches!(handle.read_sample(), Ok(Some(Capture::Frame(_)))));
        assert!(matches!(handle.read_sample(), Ok(Some(Capture::Frame(_)))));
        assert!(matches!(handle.read_sample(), Err(RecorderError::DeviceLost(_))));
        handle.close().unwrap();
        handle.close().unwrap();
    }

    #[tokio::test]
    async fn test_gps_produces_events_only() {
        let driver = SimulatedDriver::new(quick());
        let settings = Settings {
            target_rate_hz: 1000.0,
            ..Settings::default()
        };
        let mut handle = driver
            .open(DeviceRef::new(DeviceKind::Gps, 0), &settings)
            .await
            .unwrap();
        match handle.read_sample().unwrap() {
            Some(Capture::Event(record)) => {
                assert_eq!(record.channel, "fix");
                assert_eq!(record.values.len(), 3);
            }
            other => panic!("expected a fix, got {:?}", other),
        }
    }
}
