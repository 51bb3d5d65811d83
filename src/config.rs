//! Configuration system using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (`RecorderConfig::default()`)
//! 2. A TOML file (optional, e.g. `config/recorder.toml`)
//! 3. Environment variables prefixed with `DAQ_RECORDER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_RECORDER_LOGGING__LEVEL=debug
//! DAQ_RECORDER_PIPELINE__QUEUE_CAPACITY=64
//! DAQ_RECORDER_PIPELINE__DRAIN_TIMEOUT=2s
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_recorder::config::RecorderConfig;
//!
//! let config = RecorderConfig::load_from("config/recorder.toml")?;
//! println!("Work queue capacity: {}", config.pipeline.queue_capacity);
//! # Ok::<(), daq_recorder::error::RecorderError>(())
//! ```

use crate::error::{AppResult, RecorderError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_RECORDER_";

/// Top-level recorder configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Per-device module runtime
    #[serde(default)]
    pub module: ModuleConfig,
    /// Recording pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Master orchestrator
    #[serde(default)]
    pub master: MasterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Module runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Capacity of the controller's action channel
    #[serde(default = "default_action_capacity")]
    pub action_channel_capacity: usize,
    /// How often metrics snapshots are published while capturing
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,
    /// Upper bound for the whole shutdown unwind
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Recording pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Work queue capacity `C` between pacer and writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long the writer may take to drain its queue on stop
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Consecutive write failures before the recording is stopped
    #[serde(default = "default_write_failure_threshold")]
    pub write_failure_threshold: u32,
    /// Capacity of the event stream buffer
    #[serde(default = "default_event_capacity")]
    pub event_queue_capacity: usize,
    /// Flush period of the event stream log
    #[serde(default = "default_event_flush_interval", with = "humantime_serde")]
    pub event_flush_interval: Duration,
}

/// Master orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Modules to launch, one subprocess each
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    /// How long to wait for a reply to a command carrying an id
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Grace period after `shutdown` before the process is killed
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Launch description of one device module subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Unique module name used in logs and events
    pub name: String,
    /// Executable to launch
    pub program: PathBuf,
    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Device index sent with `assign_device`
    #[serde(default)]
    pub device_index: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_action_capacity() -> usize {
    64
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    32
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_write_failure_threshold() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    4096
}

fn default_event_flush_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            action_channel_capacity: default_action_capacity(),
            metrics_interval: default_metrics_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_timeout: default_drain_timeout(),
            write_failure_threshold: default_write_failure_threshold(),
            event_queue_capacity: default_event_capacity(),
            event_flush_interval: default_event_flush_interval(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            reply_timeout: default_reply_timeout(),
            shutdown_grace: default_shutdown_timeout(),
        }
    }
}

impl RecorderConfig {
    /// Defaults merged with environment overrides, no file.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not an error: figment treats it as an empty layer.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(RecorderConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Parse configuration from an in-memory TOML string (no environment layer).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let figment =
            Figment::from(Serialized::defaults(RecorderConfig::default())).merge(Toml::string(toml));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(RecorderConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(RecorderError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(RecorderError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.module.action_channel_capacity == 0 {
            return Err(RecorderError::Configuration(
                "module.action_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(RecorderError::Configuration(
                "pipeline.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.event_queue_capacity == 0 {
            return Err(RecorderError::Configuration(
                "pipeline.event_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.write_failure_threshold == 0 {
            return Err(RecorderError::Configuration(
                "pipeline.write_failure_threshold must be greater than zero".to_string(),
            ));
        }

        let timeouts = [
            ("module.metrics_interval", self.module.metrics_interval),
            ("module.shutdown_timeout", self.module.shutdown_timeout),
            ("pipeline.drain_timeout", self.pipeline.drain_timeout),
            ("pipeline.event_flush_interval", self.pipeline.event_flush_interval),
            ("master.reply_timeout", self.master.reply_timeout),
            ("master.shutdown_grace", self.master.shutdown_grace),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(RecorderError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for module in &self.master.modules {
            if !names.insert(&module.name) {
                return Err(RecorderError::Configuration(format!(
                    "Duplicate module name: '{}'",
                    module.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.queue_capacity, 32);
    }

    #[test]
    fn test_toml_overrides_and_humantime() {
        let config = RecorderConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"

            [pipeline]
            queue_capacity = 8
            drain_timeout = "750ms"

            [[master.modules]]
            name = "cam0"
            program = "daq_module"
            args = ["--kind", "camera"]
            device_index = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.pipeline.queue_capacity, 8);
        assert_eq!(config.pipeline.drain_timeout, Duration::from_millis(750));
        // untouched sections keep their defaults
        assert_eq!(config.module.action_channel_capacity, 64);
        assert_eq!(config.master.modules.len(), 1);
        assert_eq!(config.master.modules[0].args, vec!["--kind", "camera"]);
    }

    #[test]
    fn test_shipped_config_parses() {
        let text = std::fs::read_to_string(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/recorder.toml"
        ))
        .unwrap();
        let config = RecorderConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.master.modules.len(), 2);
        assert_eq!(config.pipeline.event_flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_config_survives_a_save_and_reload() {
        let text = std::fs::read_to_string(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/recorder.toml"
        ))
        .unwrap();
        let config = RecorderConfig::from_toml_str(&text).unwrap();

        let saved = toml::to_string(&config).unwrap();
        assert!(saved.contains("event_flush_interval = \"250ms\""));
        assert_eq!(RecorderConfig::from_toml_str(&saved).unwrap(), config);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RecorderConfig::default();
        config.logging.level = "loud".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let result = RecorderConfig::from_toml_str("[pipeline]\nqueue_capacity = 0\n");
        assert!(matches!(result, Err(RecorderError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_module_names() {
        let mut config = RecorderConfig::default();
        let spec = ModuleSpec {
            name: "cam".to_string(),
            program: PathBuf::from("daq_module"),
            args: vec![],
            device_index: 0,
        };
        config.master.modules = vec![spec.clone(), spec];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Duplicate module name"));
    }
}
