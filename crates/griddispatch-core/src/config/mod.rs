//! Configuration parsing and management.
//!
//! This module handles parsing of dispatch configuration files (TOML) that
//! define how jobs are rendered for the scheduler, how submissions are
//! throttled, how hierarchies are walked, and how batch workers fan out.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration for a `qsub`-style grid engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Scheduler command-line rendering.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Admission throttle policy.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Hierarchy walking and batch planning.
    #[serde(default)]
    pub walk: WalkConfig,

    /// Worker fan-out settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl DispatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "scheduler.binary must not be empty".to_string(),
            ));
        }
        if self.scheduler.hold_flag.trim().is_empty() {
            return Err(ConfigError::Validation(
                "scheduler.hold_flag must not be empty".to_string(),
            ));
        }
        if let Some(pe) = &self.scheduler.parallel_env {
            if pe.width == 0 {
                return Err(ConfigError::Validation(
                    "scheduler.parallel_env.width must be at least 1".to_string(),
                ));
            }
        }
        if self.walk.batch_size == 0 {
            return Err(ConfigError::Validation(
                "walk.batch_size must be at least 1".to_string(),
            ));
        }
        if self.walk.fanout == 0 {
            return Err(ConfigError::Validation(
                "walk.fanout must be at least 1".to_string(),
            ));
        }
        match &self.throttle {
            ThrottleConfig::Counting { max_in_flight, .. } => {
                if *max_in_flight == 0 {
                    return Err(ConfigError::Validation(
                        "throttle.max_in_flight must be at least 1".to_string(),
                    ));
                }
            },
            ThrottleConfig::Occupancy {
                threshold,
                poll_interval,
                command,
            } => {
                if *threshold == 0 {
                    return Err(ConfigError::Validation(
                        "throttle.threshold must be at least 1".to_string(),
                    ));
                }
                if poll_interval.is_zero() {
                    return Err(ConfigError::Validation(
                        "throttle.poll_interval must be non-zero".to_string(),
                    ));
                }
                if command.is_empty() {
                    return Err(ConfigError::Validation(
                        "throttle.command must name a program".to_string(),
                    ));
                }
            },
        }
        Ok(())
    }
}

/// How submissions are rendered for the external scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Scheduler submission binary.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Job name passed with `-N`.
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Output/error redirection target passed with `-o` (stderr is joined).
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Resource requests, each passed with `-l`.
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,

    /// Flag that introduces the comma-separated hold list.
    #[serde(default = "default_hold_flag")]
    pub hold_flag: String,

    /// Extra arguments inserted before the hold list.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Parallel environment request (`-pe <name> <width>`).
    #[serde(default = "default_parallel_env")]
    pub parallel_env: Option<ParallelEnvConfig>,
}

fn default_binary() -> String {
    "qsub".to_string()
}

fn default_job_name() -> String {
    "griddispatch".to_string()
}

fn default_output() -> PathBuf {
    PathBuf::from("/dev/null")
}

fn default_parallel_env() -> Option<ParallelEnvConfig> {
    Some(ParallelEnvConfig::default())
}

fn default_resources() -> Vec<String> {
    vec!["gpu=true".to_string()]
}

fn default_hold_flag() -> String {
    "-hold_jid".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            job_name: default_job_name(),
            output: default_output(),
            resources: default_resources(),
            hold_flag: default_hold_flag(),
            extra_args: Vec::new(),
            parallel_env: default_parallel_env(),
        }
    }
}

/// A parallel environment request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParallelEnvConfig {
    /// Parallel environment name.
    #[serde(default = "default_pe_name")]
    pub name: String,

    /// Number of slots to reserve. Matches the batch size by default so
    /// every member of a batch gets its own slot.
    #[serde(default = "default_pe_width")]
    pub width: u32,
}

fn default_pe_name() -> String {
    "batch".to_string()
}

const fn default_pe_width() -> u32 {
    7
}

impl Default for ParallelEnvConfig {
    fn default() -> Self {
        Self {
            name: default_pe_name(),
            width: default_pe_width(),
        }
    }
}

/// Admission throttle policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThrottleConfig {
    /// Bound the number of submissions in flight locally.
    Counting {
        /// Maximum concurrent submissions.
        #[serde(default = "default_max_in_flight")]
        max_in_flight: usize,

        /// Delay before a deferred submission retries for a slot.
        #[serde(default = "default_retry_delay")]
        #[serde(with = "humantime_serde")]
        retry_delay: Duration,
    },

    /// Poll the scheduler for the caller's job count and release queued
    /// submissions while it is below `threshold`.
    Occupancy {
        /// Job count the release logic aims for but never exceeds.
        #[serde(default = "default_threshold")]
        threshold: u64,

        /// Interval between occupancy polls.
        #[serde(default = "default_poll_interval")]
        #[serde(with = "humantime_serde")]
        poll_interval: Duration,

        /// Command printing the current job count as a bare integer.
        #[serde(default = "default_occupancy_command")]
        command: Vec<String>,
    },
}

const fn default_max_in_flight() -> usize {
    16
}

const fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

const fn default_threshold() -> u64 {
    200
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_occupancy_command() -> Vec<String> {
    vec!["my-job-count.sh".to_string()]
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::Counting {
            max_in_flight: default_max_in_flight(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Hierarchy walking and batch planning settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WalkConfig {
    /// Maximum number of sibling addresses per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent subdirectory walks per directory level.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Flag appended to the target command to list addresses.
    #[serde(default = "default_probe_flag")]
    pub probe_flag: String,

    /// Submit only the first planned batch, then stop. Debugging aid.
    #[serde(default)]
    pub only_first_batch: bool,
}

const fn default_batch_size() -> usize {
    7
}

const fn default_fanout() -> usize {
    2
}

fn default_probe_flag() -> String {
    "--print-addresses".to_string()
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fanout: default_fanout(),
            probe_flag: default_probe_flag(),
            only_first_batch: false,
        }
    }
}

/// Worker fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Flag carrying the member's positional resource index.
    #[serde(default = "default_index_flag")]
    pub index_flag: String,

    /// Flag carrying the member's node id.
    #[serde(default = "default_target_flag")]
    pub target_flag: String,

    /// Program run after each member exits to attribute logs to a host.
    /// Empty disables the step.
    #[serde(default = "default_host_probe")]
    pub host_probe: String,

    /// Executable the scheduler runs for a batch. Defaults to the current
    /// executable.
    #[serde(default)]
    pub worker_exe: Option<PathBuf>,
}

fn default_index_flag() -> String {
    "--gpu".to_string()
}

fn default_target_flag() -> String {
    "--target-address".to_string()
}

fn default_host_probe() -> String {
    "hostname".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            index_flag: default_index_flag(),
            target_flag: default_target_flag(),
            host_probe: default_host_probe(),
            worker_exe: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
