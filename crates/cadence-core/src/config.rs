//! Configuration loading and typed config structures.
//!
//! The canonical configuration lives in `cadence-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure and a loader that reads and validates the file. Every field
//! has a default, so an empty document is a valid configuration.

use std::path::Path;

use serde::Deserialize;

use crate::clock::ClockSource;
use crate::interval::{IntervalSpec, LagPolicy};
use crate::phase::PhaseId;
use crate::queue::{EvictionPolicy, QueueSpec};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The values parsed but are out of range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
///
/// Mirrors the structure of `cadence-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CadenceConfig {
    /// Tick loop settings.
    #[serde(default)]
    pub host: HostConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Demonstration workload run by the reference host.
    #[serde(default)]
    pub demo: DemoConfig,
}

impl CadenceConfig {
    /// Load configuration from a YAML file.
    ///
    /// Environment variable overrides are applied after parsing:
    /// - `CADENCE_LOG` overrides `logging.level`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.logging.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the types alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.tick_interval_ms == 0 {
            return Err(invalid("host.tick_interval_ms must be greater than zero"));
        }
        if !self.host.time_scale.is_finite() || self.host.time_scale < 0.0 {
            return Err(invalid(format!(
                "host.time_scale must be finite and non-negative, got {}",
                self.host.time_scale
            )));
        }
        if self.host.default_phase.trim().is_empty() {
            return Err(invalid("host.default_phase must not be empty"));
        }
        if self.demo.interval.interval_ms == 0 {
            return Err(invalid("demo.interval.interval_ms must be greater than zero"));
        }
        if self.demo.queue.policy.is_bounded() && self.demo.queue.capacity == 0 {
            return Err(invalid(format!(
                "demo.queue.capacity must be greater than zero for policy {:?}",
                self.demo.queue.policy
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

/// Tick loop configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostConfig {
    /// Milliseconds between ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Stop after this many ticks. Zero runs until shutdown.
    #[serde(default)]
    pub max_ticks: u64,

    /// Multiplier applied to the frame delta.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,

    /// Phase used by schedulers that do not name one.
    #[serde(default = "default_phase")]
    pub default_phase: String,
}

impl HostConfig {
    /// The default phase as an identifier.
    pub fn default_phase_id(&self) -> PhaseId {
        PhaseId::new(self.default_phase.clone())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_ticks: 0,
            time_scale: default_time_scale(),
            default_phase: default_phase(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CADENCE_LOG") {
            self.level = val;
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Demonstration workload run by the reference host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemoConfig {
    /// The periodic task that submits jobs.
    #[serde(default)]
    pub interval: IntervalConfig,

    /// The queue that runs them.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Jobs submitted per firing.
    #[serde(default = "default_jobs")]
    pub jobs: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            interval: IntervalConfig::default(),
            queue: QueueConfig::default(),
            jobs: default_jobs(),
        }
    }
}

/// Periodic task configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IntervalConfig {
    /// Milliseconds between firings.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Where elapsed time is read from.
    #[serde(default)]
    pub clock: ClockSource,

    /// Backlog handling.
    #[serde(default)]
    pub lag: LagPolicy,

    /// Phase to pump on; unset uses the default phase.
    #[serde(default)]
    pub phase: Option<PhaseId>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            clock: ClockSource::default(),
            lag: LagPolicy::default(),
            phase: None,
        }
    }
}

impl From<&IntervalConfig> for IntervalSpec {
    fn from(config: &IntervalConfig) -> Self {
        Self {
            phase: config.phase.clone(),
            ..Self::from_millis(config.interval_ms)
                .clock(config.clock)
                .lag(config.lag)
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Eviction policy.
    #[serde(default)]
    pub policy: EvictionPolicy,

    /// Capacity enforced by bounded policies.
    #[serde(default)]
    pub capacity: usize,

    /// Phase to pump on; unset uses the default phase.
    #[serde(default)]
    pub phase: Option<PhaseId>,
}

impl From<&QueueConfig> for QueueSpec {
    fn from(config: &QueueConfig) -> Self {
        Self {
            phase: config.phase.clone(),
            ..Self::bounded(config.policy, config.capacity)
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions for serde
// ---------------------------------------------------------------------------

const fn default_tick_interval_ms() -> u64 {
    16
}

const fn default_time_scale() -> f64 {
    1.0
}

fn default_phase() -> String {
    "Update".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_jobs() -> u32 {
    3
}

const fn default_interval_ms() -> u64 {
    250
}
