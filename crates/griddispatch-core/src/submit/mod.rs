//! Job submission.
//!
//! A [`Submitter`] turns one batch (its hold set and the command the
//! scheduler should run) into an external job id. The production
//! implementation shells out to a `qsub`-style binary; [`DryRunSubmitter`]
//! logs the command line it would have run and hands out sequential ids.
//!
//! # Job id parsing
//!
//! The scheduler prints the id on stdout (`-terse`). Only the leading run of
//! digits is used, so array-job output such as `4711.1-10:1` yields `4711`.
//! Output without leading digits is a [`SubmitError::InvalidJobId`]; it is
//! never turned into a placeholder id.

pub mod command;

use std::collections::BTreeSet;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;

/// External scheduler job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Parse scheduler stdout into a job id.
    #[must_use]
    pub fn parse_output(output: &str) -> Option<Self> {
        let trimmed = output.trim_start();
        let end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        trimmed[..end].parse().ok().map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One batch ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Node ids covered by the batch, for logging.
    pub members: Vec<String>,
    /// Job ids that must complete before this batch may start.
    pub holds: BTreeSet<JobId>,
    /// Command the scheduler runs for the batch.
    pub command: Vec<String>,
}

/// Errors from a single submission.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// The scheduler binary could not be started.
    #[error("failed to spawn scheduler '{program}': {source}")]
    Spawn {
        /// Scheduler program.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler exited unsuccessfully without printing a job id.
    #[error("scheduler rejected submission ({status}): {stderr}")]
    Rejected {
        /// Exit status as reported by the OS.
        status: String,
        /// Captured stderr.
        stderr: String,
    },

    /// The scheduler's stdout did not start with an integer job id.
    #[error("scheduler returned unparsable job id: {output:?}")]
    InvalidJobId {
        /// Captured stdout.
        output: String,
    },
}

/// Submits batches to the external scheduler.
#[async_trait]
pub trait Submitter: Send + Sync + fmt::Debug {
    /// Submit one batch and return its job id.
    ///
    /// # Errors
    ///
    /// Returns a `SubmitError` if the scheduler cannot be run or its reply
    /// is not a job id.
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, SubmitError>;
}

/// Submits through a `qsub`-compatible binary.
#[derive(Debug, Clone)]
pub struct QsubSubmitter {
    config: SchedulerConfig,
}

impl QsubSubmitter {
    /// Create a submitter for the given scheduler configuration.
    #[must_use]
    pub const fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Submitter for QsubSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, SubmitError> {
        let argv = command::render_submission(&self.config, &request.holds, &request.command);
        debug!(members = ?request.members, argv = ?argv, "submitting batch");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| SubmitError::Spawn {
                program: argv[0].clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!(members = ?request.members, "scheduler stderr: {stderr}");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match JobId::parse_output(&stdout) {
            Some(job) => {
                if !output.status.success() {
                    warn!(%job, status = %output.status, "scheduler exited unsuccessfully after issuing a job id");
                }
                Ok(job)
            },
            None if !output.status.success() => Err(SubmitError::Rejected {
                status: output.status.to_string(),
                stderr,
            }),
            None => Err(SubmitError::InvalidJobId {
                output: stdout.into_owned(),
            }),
        }
    }
}

/// Logs the command line instead of submitting, returning ids 1, 2, 3, ...
#[derive(Debug)]
pub struct DryRunSubmitter {
    config: SchedulerConfig,
    next: AtomicU64,
}

impl DryRunSubmitter {
    /// Create a dry-run submitter rendering with the given configuration.
    #[must_use]
    pub const fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            next: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Submitter for DryRunSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, SubmitError> {
        let argv = command::render_submission(&self.config, &request.holds, &request.command);
        let job = JobId::new(self.next.fetch_add(1, Ordering::Relaxed));
        info!(%job, members = ?request.members, "dry run: {}", argv.join(" "));
        Ok(job)
    }
}
