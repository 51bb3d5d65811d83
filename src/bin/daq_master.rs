//! Master entry point: launch the configured modules, record one trial,
//! shut everything down.
//!
//! ```bash
//! daq_master --config config/recorder.toml --session-dir /data/session_1 --trial 1 --duration 5s
//! ```
//!
//! Without configured modules a single simulated camera module is launched
//! from the binary next to this one.

use anyhow::{Context, Result};
use clap::Parser;
use daq_recorder::config::{ModuleSpec, RecorderConfig};
use daq_recorder::logging;
use daq_recorder::master::{ExitOutcome, Master};
use daq_recorder::protocol::CommandMessage;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "daq_master")]
#[command(about = "Drive per-device recording modules through one trial", long_about = None)]
struct Cli {
    /// Optional configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session directory receiving every module's outputs
    #[arg(long)]
    session_dir: PathBuf,

    /// Trial number
    #[arg(long, default_value_t = 1)]
    trial: u32,

    /// Recording duration, e.g. "5s" or "1m 30s"
    #[arg(long, default_value = "5s", value_parser = humantime_serde::re::humantime::parse_duration)]
    duration: Duration,

    /// Device index for the default module when none are configured
    #[arg(long, default_value_t = 0)]
    device_index: u32,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn default_modules(device_index: u32) -> Result<Vec<ModuleSpec>> {
    let program = std::env::current_exe()
        .context("Cannot locate the master executable")?
        .with_file_name(format!("daq_module{}", std::env::consts::EXE_SUFFIX));
    Ok(vec![ModuleSpec {
        name: format!("camera_{}", device_index),
        program,
        args: vec!["--kind".into(), "camera".into()],
        device_index,
    }])
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RecorderConfig::load().context("Failed to load configuration")?,
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
        config.validate()?;
    }
    logging::init_from_config(&config)?;

    let specs = if config.master.modules.is_empty() {
        default_modules(cli.device_index)?
    } else {
        config.master.modules.clone()
    };

    let mut master = Master::from_config(&config.master);
    if let Some(mut events) = master.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.status.is_error() {
                    warn!(module = %event.module, data = ?event.status.data, "Module reported an error");
                } else {
                    info!(module = %event.module, status = %event.status.status, data = ?event.status.data, "Module status");
                }
            }
        });
    }

    for spec in &specs {
        master.launch(spec)?;
    }

    let result = record_trial(&master, &specs, &cli).await;
    if let Err(e) = &result {
        error!(error = %e, "Trial failed");
    }

    for (module, outcome) in master.shutdown(config.master.shutdown_grace).await {
        match outcome {
            ExitOutcome::Exited(status) => info!(module = %module, %status, "Module stopped"),
            ExitOutcome::Killed => warn!(module = %module, "Module was killed"),
            ExitOutcome::Failed(e) => error!(module = %module, error = %e, "Module could not be stopped"),
        }
    }

    result
}

async fn record_trial(master: &Master, specs: &[ModuleSpec], cli: &Cli) -> Result<()> {
    for spec in specs {
        let reply = master
            .send(
                &spec.name,
                CommandMessage::new("assign_device").with_param("device_index", spec.device_index),
            )
            .await?;
        if reply.is_error() {
            anyhow::bail!("module '{}' could not assign its device: {:?}", spec.name, reply.data);
        }
        info!(module = %spec.name, status = %reply.status, "Device assigned");
    }

    let start = CommandMessage::new("start_recording")
        .with_param("session_dir", cli.session_dir.to_string_lossy().into_owned())
        .with_param("trial_number", cli.trial);
    for (module, reply) in master.broadcast(start).await {
        let reply = reply?;
        if reply.is_error() {
            anyhow::bail!("module '{}' did not start recording: {:?}", module, reply.data);
        }
        info!(module = %module, data = ?reply.data, "Recording started");
    }

    tokio::time::sleep(cli.duration).await;

    for (module, reply) in master.broadcast(CommandMessage::new("stop_recording")).await {
        match reply {
            Ok(reply) => println!(
                "{}: {} {}",
                module,
                reply.status,
                reply.data.map(|d| d.to_string()).unwrap_or_default()
            ),
            Err(e) => error!(module = %module, error = %e, "Stop failed"),
        }
    }
    Ok(())
}
