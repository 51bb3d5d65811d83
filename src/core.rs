//! Core data types shared by the controller, the pipeline and the devices.
//!
//! # Data Flow
//!
//! ```text
//! DeviceHandle --[Capture::Frame]--> Mailbox --> Pacer --> WorkQueue --> Writer
//!              --[Capture::Event]--> EventLog (drop-oldest, periodic flush)
//! ```
//!
//! Everything in here is an immutable value: `Settings` and `Capabilities` are
//! replaced wholesale, `Metrics` is a snapshot published by the owner of the
//! counters.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Device identity
// =============================================================================

/// Kind of hardware a module drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Video camera (fixed-cadence frames)
    Camera,
    /// Audio input (fixed-cadence sample blocks)
    Audio,
    /// Eye tracker (scene frames plus gaze/IMU events)
    EyeTracker,
    /// GPS receiver (position fixes as events)
    Gps,
    /// Behavioral task event source
    TaskEvents,
}

impl DeviceKind {
    /// Stable slug used in directory names and protocol payloads.
    pub fn slug(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Audio => "audio",
            DeviceKind::EyeTracker => "eyetracker",
            DeviceKind::Gps => "gps",
            DeviceKind::TaskEvents => "events",
        }
    }

    /// Parse a slug or snake_case name.
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "camera" => Some(DeviceKind::Camera),
            "audio" => Some(DeviceKind::Audio),
            "eyetracker" | "eye_tracker" => Some(DeviceKind::EyeTracker),
            "gps" => Some(DeviceKind::Gps),
            "events" | "task_events" => Some(DeviceKind::TaskEvents),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Reference to one physical device: its kind and discovery index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Device kind
    pub kind: DeviceKind,
    /// Discovery index among devices of the same kind
    pub index: u32,
}

impl DeviceRef {
    /// Create a new device reference
    pub fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }

    /// Per-device identifier embedded in every output path, e.g. `camera_0`.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.kind.slug(), self.index)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.slug(), self.index)
    }
}

// =============================================================================
// Lifecycle status
// =============================================================================

/// Device (stream) lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// No device assigned
    #[default]
    Idle,
    /// Capabilities are being probed
    Assigning,
    /// Device open and capturing
    Streaming,
    /// Device failed; must be unassigned
    Error,
}

/// Recording lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Not recording
    #[default]
    Stopped,
    /// Writer and timing log are being started
    Starting,
    /// Pipeline running
    Recording,
    /// Pipeline draining
    Stopping,
}

// =============================================================================
// Settings and capabilities
// =============================================================================

/// Frame size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Device settings. Replaced wholesale on `ApplySettings`, never mutated in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Capture resolution (cameras)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Native sample rate (audio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_hz: Option<u32>,
    /// Target capture rate
    pub target_rate_hz: f64,
    /// Preview sub-rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_rate_hz: Option<f64>,
    /// Recording sub-rate; falls back to `target_rate_hz`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_rate_hz: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resolution: None,
            sample_rate_hz: None,
            target_rate_hz: 30.0,
            preview_rate_hz: None,
            record_rate_hz: None,
        }
    }
}

impl Settings {
    /// Rate at which the pacer emits output items.
    pub fn record_rate(&self) -> f64 {
        self.record_rate_hz.unwrap_or(self.target_rate_hz)
    }

    /// True when every rate is finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        let positive = |r: f64| r.is_finite() && r > 0.0;
        positive(self.target_rate_hz)
            && self.preview_rate_hz.map_or(true, positive)
            && self.record_rate_hz.map_or(true, positive)
    }
}

/// One supported capture mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceMode {
    /// Frame size, if applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Maximum rate in this mode
    pub max_rate_hz: f64,
}

/// Capabilities discovered once per assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Hardware identifier string (model / serial)
    pub hardware_id: String,
    /// Supported capture modes
    pub modes: Vec<DeviceMode>,
    /// Controllable parameters
    pub controls: Vec<String>,
    /// Whether the device produces fixed-cadence frames
    pub produces_frames: bool,
    /// Names of event channels (gaze, imu, fix, ...)
    pub event_channels: Vec<String>,
    /// Extension of the recorded media file
    pub file_extension: String,
}

// =============================================================================
// Metrics
// =============================================================================

/// Immutable counters snapshot, replaced on every publish.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Samples delivered by the device
    pub captured: u64,
    /// Items written by the pipeline writer
    pub recorded: u64,
    /// Items emitted as duplicates of the previous sample
    pub duplicated: u64,
    /// Items evicted from the work queue
    pub dropped: u64,
    /// Frames handed to the preview at the preview sub-rate
    pub previewed: u64,
    /// Samples overwritten in the mailbox before the pacer read them
    pub overwritten: u64,
    /// Event records delivered by the device
    pub events: u64,
    /// Estimated capture rate over the last interval
    pub capture_rate_hz: f64,
    /// Estimated write rate over the last interval
    pub record_rate_hz: f64,
}

// =============================================================================
// Captured data
// =============================================================================

/// One fixed-cadence media sample (frame, audio block).
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Device-side sequence number
    pub sequence: u64,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
    /// Encoded payload, cheap to clone for duplicates
    pub payload: Bytes,
}

/// One event-stream record (gaze point, IMU reading, GPS fix, task event).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event channel name
    pub channel: String,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
    /// Channel values
    pub values: Vec<f64>,
}

/// Result of one device read.
#[derive(Clone, Debug, PartialEq)]
pub enum Capture {
    /// A media frame for the paced stream
    Frame(Sample),
    /// A discrete event for the event log
    Event(EventRecord),
}
