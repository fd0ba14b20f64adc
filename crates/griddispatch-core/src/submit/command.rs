//! Scheduler command-line construction.
//!
//! Rendering is pure so the exact argv can be asserted in tests and logged
//! verbatim in dry-run mode.
//!
//! # Invariants
//!
//! - [INV-CMD-001] The hold flag is emitted iff the hold set is non-empty.
//! - [INV-CMD-002] Holds are rendered comma-joined in ascending order, so
//!   the same inputs always produce the same argv.
//! - [INV-CMD-003] The batch command is appended last, one argv element per
//!   word, so the scheduler runs it without shell re-splitting.

use std::collections::BTreeSet;
use std::path::Path;

use super::JobId;
use crate::config::{SchedulerConfig, WorkerConfig};

/// Render the full scheduler argv (binary first) for one batch.
#[must_use]
pub fn render_submission(
    config: &SchedulerConfig,
    holds: &BTreeSet<JobId>,
    batch_command: &[String],
) -> Vec<String> {
    let mut args = Vec::with_capacity(24 + batch_command.len());
    args.push(config.binary.clone());
    args.extend(["-terse", "-V", "-N"].into_iter().map(str::to_string));
    args.push(config.job_name.clone());
    args.extend(["-j", "y", "-o"].into_iter().map(str::to_string));
    args.push(config.output.display().to_string());
    args.extend(["-b", "y", "-cwd"].into_iter().map(str::to_string));

    if let Some(pe) = &config.parallel_env {
        args.push("-pe".to_string());
        args.push(pe.name.clone());
        args.push(pe.width.to_string());
    }

    for resource in &config.resources {
        args.push("-l".to_string());
        args.push(resource.clone());
    }

    args.extend(config.extra_args.iter().cloned());

    if !holds.is_empty() {
        args.push(config.hold_flag.clone());
        args.push(join_holds(holds));
    }

    args.extend(batch_command.iter().cloned());
    args
}

/// Comma-join a hold set in ascending order.
#[must_use]
pub fn join_holds(holds: &BTreeSet<JobId>) -> String {
    holds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// The command the scheduler runs for an address batch: this program's
/// `worker` subcommand, the comma-joined members, then the target command.
#[must_use]
pub fn worker_invocation(
    worker_exe: &Path,
    worker: &WorkerConfig,
    members: &[String],
    target_command: &[String],
) -> Vec<String> {
    let mut args = vec![
        worker_exe.display().to_string(),
        "worker".to_string(),
        "--index-flag".to_string(),
        worker.index_flag.clone(),
        "--target-flag".to_string(),
        worker.target_flag.clone(),
    ];
    if worker.host_probe.is_empty() {
        args.push("--no-host-probe".to_string());
    } else {
        args.push("--host-probe".to_string());
        args.push(worker.host_probe.clone());
    }
    args.push(members.join(","));
    args.push("--".to_string());
    args.extend(target_command.iter().cloned());
    args
}

/// The command the scheduler runs for one directory: the task followed by
/// the directory path.
#[must_use]
pub fn directory_invocation(task: &[String], dir: &Path) -> Vec<String> {
    let mut args = task.to_vec();
    args.push(dir.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::ParallelEnvConfig;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_render_without_holds() {
        let config = SchedulerConfig::default();
        let argv = render_submission(&config, &BTreeSet::new(), &words("./worker 11,12"));
        assert_eq!(
            argv,
            words(
                "qsub -terse -V -N griddispatch -j y -o /dev/null -b y -cwd \
                 -pe batch 7 -l gpu=true ./worker 11,12"
            )
        );
        assert!(!argv.contains(&"-hold_jid".to_string()));
    }

    #[test]
    fn test_render_with_sorted_holds() {
        let config = SchedulerConfig::default();
        let holds = BTreeSet::from([JobId::new(30), JobId::new(4), JobId::new(12)]);
        let argv = render_submission(&config, &holds, &words("task /data/a"));
        let pos = argv.iter().position(|a| a == "-hold_jid").unwrap();
        assert_eq!(argv[pos + 1], "4,12,30");
        assert_eq!(&argv[pos + 2..], &words("task /data/a")[..]);
    }

    #[test]
    fn test_render_without_parallel_env() {
        let config = SchedulerConfig {
            job_name: "tilebase-cache".to_string(),
            resources: vec!["short=true".to_string()],
            parallel_env: None,
            extra_args: vec!["-q".to_string(), "fast.q".to_string()],
            ..SchedulerConfig::default()
        };
        let argv = render_submission(&config, &BTreeSet::new(), &words("copy /x"));
        assert!(!argv.contains(&"-pe".to_string()));
        assert_eq!(
            argv,
            words(
                "qsub -terse -V -N tilebase-cache -j y -o /dev/null -b y -cwd \
                 -l short=true -q fast.q copy /x"
            )
        );
    }

    #[test]
    fn test_render_custom_parallel_env() {
        let config = SchedulerConfig {
            parallel_env: Some(ParallelEnvConfig {
                name: "smp".to_string(),
                width: 3,
            }),
            ..SchedulerConfig::default()
        };
        let argv = render_submission(&config, &BTreeSet::new(), &[]);
        let pos = argv.iter().position(|a| a == "-pe").unwrap();
        assert_eq!(argv[pos + 1], "smp");
        assert_eq!(argv[pos + 2], "3");
    }

    #[test]
    fn test_worker_invocation_shape() {
        let argv = worker_invocation(
            &PathBuf::from("/usr/bin/griddispatch"),
            &WorkerConfig::default(),
            &["11".to_string(), "12".to_string()],
            &words("render in out"),
        );
        assert_eq!(
            argv,
            words(
                "/usr/bin/griddispatch worker --index-flag --gpu \
                 --target-flag --target-address --host-probe hostname \
                 11,12 -- render in out"
            )
        );
    }

    #[test]
    fn test_worker_invocation_without_host_probe() {
        let worker = WorkerConfig {
            host_probe: String::new(),
            ..WorkerConfig::default()
        };
        let argv = worker_invocation(&PathBuf::from("gd"), &worker, &["5".to_string()], &[]);
        assert!(argv.contains(&"--no-host-probe".to_string()));
        assert!(!argv.contains(&"--host-probe".to_string()));
        assert_eq!(argv.last().unwrap(), "--");
    }

    #[test]
    fn test_directory_invocation_appends_path() {
        let argv = directory_invocation(&words("copy-tiles --fast"), Path::new("/data/a"));
        assert_eq!(argv, words("copy-tiles --fast /data/a"));
    }
}
