//! Device collaborator contracts.
//!
//! A driver discovers capabilities and opens handles; a handle is a blocking
//! open/read/close triple driven from the executor's capture thread. Real SDK
//! bindings implement these traits outside this crate; [`SimulatedDriver`]
//! stands in for hardware in the module binary and in tests.

pub mod simulated;

pub use simulated::{SimulatedConfig, SimulatedDriver, SimulatedGap};

use crate::core::{Capabilities, Capture, DeviceRef, Settings};
use crate::error::AppResult;
use async_trait::async_trait;

/// Discovers and opens devices of one kind.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Capability discovery. Failure surfaces as a probe error.
    async fn probe(&self, device: DeviceRef) -> AppResult<Capabilities>;

    /// Open the device with initial settings.
    async fn open(&self, device: DeviceRef, settings: &Settings) -> AppResult<Box<dyn DeviceHandle>>;
}

/// An open device. Owned by exactly one capture thread at a time.
pub trait DeviceHandle: Send {
    /// Block until the next capture. `Ok(None)` means nothing arrived within
    /// the device's internal timeout; `Err` means the device is lost.
    fn read_sample(&mut self) -> AppResult<Option<Capture>>;

    /// Reconfigure between reads.
    fn apply_settings(&mut self, settings: &Settings) -> AppResult<()>;

    /// Release the device. Must tolerate repeated calls.
    fn close(&mut self) -> AppResult<()>;
}
