//! Core library for the daq_recorder modules and master.
//!
//! Each device is owned by a module process whose behaviour is a pure
//! reducer over [`controller::DeviceState`]. The reducer returns effects that
//! the [`executor::EffectExecutor`] performs against a
//! [`device::DeviceDriver`], feeding captured samples through the
//! [`pipeline`] (mailbox, pacer, work queue, writer) onto disk. Modules speak
//! the JSON-lines [`protocol`] on stdin/stdout; the [`master`] launches and
//! drives them.

pub mod config;
pub mod controller;
pub mod core;
pub mod device;
pub mod error;
pub mod executor;
pub mod logging;
pub mod master;
pub mod module;
pub mod pipeline;
pub mod protocol;
pub mod session;
