//! Device module entry point.
//!
//! Reads JSON commands from stdin, writes JSON statuses to stdout, logs to
//! stderr. Normally launched by `daq_master`, but can be driven by hand:
//!
//! ```bash
//! echo '{"command":"assign_device","command_id":"c1","device_index":0}' | daq_module --kind camera
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use daq_recorder::config::RecorderConfig;
use daq_recorder::core::{DeviceKind, Settings};
use daq_recorder::device::{SimulatedConfig, SimulatedDriver};
use daq_recorder::logging;
use daq_recorder::module::DeviceModule;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "daq_module")]
#[command(about = "Per-device recording module driven over stdin/stdout", long_about = None)]
struct Cli {
    /// Device kind handled by this module (camera, audio, eyetracker, gps, events)
    #[arg(long, default_value = "camera")]
    kind: String,

    /// Optional configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial target capture rate in Hz
    #[arg(long, default_value_t = 30.0)]
    rate: f64,

    /// Recording rate in Hz (defaults to the target rate)
    #[arg(long)]
    record_rate: Option<f64>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Relative jitter of the simulated capture interval
    #[arg(long, default_value_t = 0.2)]
    sim_jitter: f64,

    /// Number of simulated devices attached
    #[arg(long, default_value_t = 2)]
    sim_devices: u32,

    /// Make capability probing fail
    #[arg(long)]
    sim_fail_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RecorderConfig::load().context("Failed to load configuration")?,
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let kind = DeviceKind::from_slug(&cli.kind)
        .with_context(|| format!("Unknown device kind '{}'", cli.kind))?;
    let settings = Settings {
        target_rate_hz: cli.rate,
        record_rate_hz: cli.record_rate,
        ..Settings::default()
    };
    if !settings.is_valid() {
        anyhow::bail!("Rates must be finite and positive");
    }

    let driver = SimulatedDriver::new(SimulatedConfig {
        available: cli.sim_devices,
        jitter: cli.sim_jitter,
        fail_probe: cli.sim_fail_probe,
        ..SimulatedConfig::default()
    });

    DeviceModule::new(kind, Arc::new(driver), config)
        .with_settings(settings)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}
