//! Worker fan-out.
//!
//! A single scheduler job covers a whole batch. When the scheduler runs it,
//! the `worker` subcommand starts one copy of the target program per batch
//! member, concurrently, and tells each copy which slot it owns:
//!
//! ```text
//! <template...> <index_flag> <i> <target_flag> <member>
//! ```
//!
//! `i` is the member's position in the batch, not anything derived from the
//! address, so a batch `["5", "9", "3"]` uses slots 0, 1 and 2. The overrides
//! go last so they win over any earlier occurrence in the template.
//!
//! Each member's stdout and stderr are captured and written out in one piece
//! when that member finishes, keeping concurrent members from interleaving
//! line by line.
//!
//! # Invariants
//!
//! - [INV-FAN-001] Each member reports completion exactly once, whether its
//!   process exited or failed to start.
//! - [INV-FAN-002] The batch completes only after every member completed.
//! - [INV-FAN-003] The host identity step never changes a member's status.

use std::fmt;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

/// Errors that prevent a batch from starting at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FanoutError {
    /// The command template was empty.
    #[error("worker command template is empty")]
    EmptyTemplate,

    /// The member list was empty.
    #[error("worker batch has no members")]
    NoMembers,
}

/// How one member ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberStatus {
    /// Exited with status zero.
    Succeeded,
    /// Exited unsuccessfully. `code` is `None` when killed by a signal.
    Failed {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// The process could not be started or waited on.
    SpawnFailed {
        /// Error text.
        reason: String,
    },
    /// The member task ended without reporting.
    Lost,
}

impl MemberStatus {
    /// Whether the member succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Failed { code: None } => f.write_str("terminated by signal"),
            Self::SpawnFailed { reason } => write!(f, "failed to start: {reason}"),
            Self::Lost => f.write_str("lost"),
        }
    }
}

/// One member's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberOutcome {
    /// Slot index passed to the member.
    pub index: usize,
    /// Member id passed as the target.
    pub member: String,
    /// How it ended.
    pub status: MemberStatus,
}

/// Result of a whole batch, in member order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Per-member results.
    pub members: Vec<MemberOutcome>,
}

impl BatchOutcome {
    /// Whether every member succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.members.iter().all(|m| m.status.is_success())
    }

    /// Members that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &MemberOutcome> {
        self.members.iter().filter(|m| !m.status.is_success())
    }
}

/// Build the argv for member `index`.
#[must_use]
pub fn member_command(
    template: &[String],
    index_flag: &str,
    index: usize,
    target_flag: &str,
    member: &str,
) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + 4);
    argv.extend(template.iter().cloned());
    argv.push(index_flag.to_string());
    argv.push(index.to_string());
    argv.push(target_flag.to_string());
    argv.push(member.to_string());
    argv
}

/// Delivers a member's outcome once; later attempts are ignored.
struct Completion {
    tx: Option<oneshot::Sender<MemberStatus>>,
}

impl Completion {
    fn complete(&mut self, status: MemberStatus) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The batch may have stopped listening; nothing to do then.
                let _ = tx.send(status);
                true
            },
            None => false,
        }
    }
}

/// Run every member of a batch and wait for all of them.
///
/// # Errors
///
/// Returns `FanoutError` if the template or member list is empty. Member
/// failures are reported in the outcome, not as errors.
pub async fn run_batch(
    members: &[String],
    template: &[String],
    config: &WorkerConfig,
) -> Result<BatchOutcome, FanoutError> {
    if template.is_empty() {
        return Err(FanoutError::EmptyTemplate);
    }
    if members.is_empty() {
        return Err(FanoutError::NoMembers);
    }

    info!(members = members.len(), "starting batch");

    let mut pending = Vec::with_capacity(members.len());
    for (index, member) in members.iter().enumerate() {
        let (tx, rx) = oneshot::channel();
        let argv = member_command(template, &config.index_flag, index, &config.target_flag, member);
        let host_probe = config.host_probe.clone();
        let member_id = member.clone();
        tokio::spawn(async move {
            let mut completion = Completion { tx: Some(tx) };
            run_member(index, &member_id, &argv, &host_probe, &mut completion).await;
        });
        pending.push((index, member.clone(), rx));
    }

    let mut outcome = BatchOutcome::default();
    for (index, member, rx) in pending {
        let status = rx.await.unwrap_or(MemberStatus::Lost);
        if !status.is_success() {
            warn!(index, member = %member, status = %status, "member did not succeed");
        }
        outcome.members.push(MemberOutcome {
            index,
            member,
            status,
        });
    }

    info!(
        members = outcome.members.len(),
        failed = outcome.failures().count(),
        "batch finished"
    );
    Ok(outcome)
}

async fn run_member(
    index: usize,
    member: &str,
    argv: &[String],
    host_probe: &str,
    completion: &mut Completion,
) {
    debug!(index, member, argv = ?argv, "starting member");

    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let status = match output {
        Ok(output) => {
            flush(&output.stdout, &output.stderr).await;
            if output.status.success() {
                MemberStatus::Succeeded
            } else {
                MemberStatus::Failed {
                    code: output.status.code(),
                }
            }
        },
        Err(e) => MemberStatus::SpawnFailed {
            reason: e.to_string(),
        },
    };

    if !host_probe.is_empty() {
        log_host(index, member, host_probe).await;
    }

    completion.complete(status);
}

async fn flush(stdout: &[u8], stderr: &[u8]) {
    if !stdout.is_empty() {
        let mut out = tokio::io::stdout();
        if let Err(e) = out.write_all(stdout).await {
            debug!(error = %e, "failed to relay member stdout");
        }
        if let Err(e) = out.flush().await {
            debug!(error = %e, "failed to flush member stdout");
        }
    }
    if !stderr.is_empty() {
        let mut err = tokio::io::stderr();
        if let Err(e) = err.write_all(stderr).await {
            debug!(error = %e, "failed to relay member stderr");
        }
        if let Err(e) = err.flush().await {
            debug!(error = %e, "failed to flush member stderr");
        }
    }
}

async fn log_host(index: usize, member: &str, host_probe: &str) {
    match Command::new(host_probe)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let host = String::from_utf8_lossy(&output.stdout);
            info!(index, member, host = host.trim(), "member ran on host");
        },
        Ok(output) => {
            debug!(index, member, status = %output.status, "host probe failed");
        },
        Err(e) => {
            debug!(index, member, error = %e, "host probe could not start");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    fn quiet() -> WorkerConfig {
        WorkerConfig {
            host_probe: String::new(),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_member_command_appends_overrides() {
        let argv = member_command(&strings(&["render", "--gpu", "7"]), "--gpu", 2, "--target-address", "31");
        assert_eq!(
            argv,
            strings(&["render", "--gpu", "7", "--gpu", "2", "--target-address", "31"])
        );
    }

    #[test]
    fn test_completion_fires_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut completion = Completion { tx: Some(tx) };
        assert!(completion.complete(MemberStatus::Succeeded));
        assert!(!completion.complete(MemberStatus::Lost));
        assert_eq!(rx.try_recv().unwrap(), MemberStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_rejects_empty_inputs() {
        let config = quiet();
        assert!(matches!(
            run_batch(&strings(&["1"]), &[], &config).await,
            Err(FanoutError::EmptyTemplate)
        ));
        assert!(matches!(
            run_batch(&[], &strings(&["true"]), &config).await,
            Err(FanoutError::NoMembers)
        ));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_indices_follow_position_not_value() {
        let dir = tempfile::tempdir().unwrap();
        // $2 is the slot index, $4 the member id.
        let script = format!("echo \"$2\" > '{}'/\"$4\"", dir.path().display());
        let template = strings(&["sh", "-c", &script, "sh"]);

        let outcome = run_batch(&strings(&["5", "9", "3"]), &template, &quiet())
            .await
            .unwrap();
        assert!(outcome.all_succeeded());

        let slot = |member: &str| {
            std::fs::read_to_string(dir.path().join(member))
                .unwrap()
                .trim()
                .to_string()
        };
        assert_eq!(slot("5"), "0");
        assert_eq!(slot("9"), "1");
        assert_eq!(slot("3"), "2");

        let order: Vec<_> = outcome.members.iter().map(|m| (m.index, m.member.as_str())).collect();
        assert_eq!(order, vec![(0, "5"), (1, "9"), (2, "3")]);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_member_failure_does_not_stop_siblings() {
        // Member "2" fails; the others succeed.
        let template = strings(&["sh", "-c", "test \"$4\" != 2", "sh"]);
        let outcome = run_batch(&strings(&["1", "2", "3"]), &template, &quiet())
            .await
            .unwrap();

        assert_eq!(outcome.members.len(), 3);
        assert!(!outcome.all_succeeded());
        let failed: Vec<_> = outcome.failures().map(|m| m.member.as_str()).collect();
        assert_eq!(failed, vec!["2"]);
        assert_eq!(outcome.members[1].status, MemberStatus::Failed { code: Some(1) });
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_failure_is_reported_per_member() {
        let template = strings(&["nonexistent_worker_12345"]);
        let outcome = run_batch(&strings(&["4", "5"]), &template, &quiet())
            .await
            .unwrap();
        assert_eq!(outcome.members.len(), 2);
        assert!(outcome
            .members
            .iter()
            .all(|m| matches!(m.status, MemberStatus::SpawnFailed { .. })));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_host_probe_failure_keeps_status() {
        let config = WorkerConfig {
            host_probe: "nonexistent_hostname_12345".to_string(),
            ..WorkerConfig::default()
        };
        let outcome = run_batch(&strings(&["1"]), &strings(&["true"]), &config)
            .await
            .unwrap();
        assert!(outcome.all_succeeded());
    }
}
