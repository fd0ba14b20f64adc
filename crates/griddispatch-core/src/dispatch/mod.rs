//! The dispatcher: turns a hierarchy into ordered, held scheduler jobs.
//!
//! # Address mode
//!
//! Addresses are planned into depth-homogeneous batches (see
//! [`planner`](crate::planner)). Depths are dispatched deepest first; all
//! batches of one depth go through the throttle concurrently and the next
//! depth starts only once every batch of the current one has returned. Each
//! batch holds on the union of its members' recorded holds, and its job id
//! is recorded against each member's parent.
//!
//! # Directory mode
//!
//! Every directory is its own batch. A directory lists its entries, walks
//! its subdirectories with at most `fanout` walks in flight, waits for all
//! of them, then submits itself holding on whatever its children recorded.
//! Listing and metadata failures end that branch quietly: the branch
//! contributes no hold and does not block its parent.
//!
//! # Leaf mode
//!
//! Only leaf directories, those without subdirectories, are submitted. A
//! branch directory is never submitted itself; its subdirectories are walked
//! with at most `fanout` walks in flight and files directly inside it are
//! left alone. Leaf jobs are independent and carry no holds. An entry whose
//! metadata cannot be read counts as a file; a directory that cannot be
//! listed is dropped.
//!
//! # Failure propagation
//!
//! A batch whose submission fails, or which is skipped, marks its members'
//! parents blocked. A batch with a blocked member is skipped. Unrelated
//! branches keep going.

mod report;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, join_all};
use futures::{FutureExt, StreamExt, stream};
pub use report::{DispatchReport, FailedBatch, SubmittedBatch};
use tracing::{debug, info, warn};

use crate::config::{DispatchConfig, WalkConfig, WorkerConfig};
use crate::error::DispatchError;
use crate::hierarchy::{self, Address, tree};
use crate::ledger::DependencyLedger;
use crate::planner::{self, Batch};
use crate::submit::command::{directory_invocation, worker_invocation};
use crate::submit::{SubmitRequest, Submitter};
use crate::throttle::AdmissionThrottle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fail unless `root` is an existing directory.
async fn check_root(root: &Path) -> Result<(), DispatchError> {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(DispatchError::RootNotDirectory {
            path: root.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DispatchError::RootNotFound {
            path: root.to_path_buf(),
        }),
        Err(source) => Err(DispatchError::RootIo {
            path: root.to_path_buf(),
            source,
        }),
    }
}

/// What happened to one batch.
enum BatchResult {
    Submitted(SubmittedBatch),
    Failed(FailedBatch),
    Skipped(Vec<String>),
}

impl BatchResult {
    fn record(self, report: &mut DispatchReport) {
        match self {
            Self::Submitted(batch) => report.record_submitted(batch),
            Self::Failed(batch) => report.failed.push(batch),
            Self::Skipped(members) => report.skipped.push(members),
        }
    }
}

/// Drives discovery, planning, throttling and submission.
#[derive(Debug)]
pub struct Dispatcher {
    submitter: Arc<dyn Submitter>,
    throttle: AdmissionThrottle,
    walk: WalkConfig,
    worker: WorkerConfig,
    worker_exe: PathBuf,
}

impl Dispatcher {
    /// Create a dispatcher from configuration.
    ///
    /// Starts the configured throttle, so this must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` for invalid configuration and
    /// `DispatchError::WorkerExe` if no worker executable is configured and
    /// the current executable cannot be determined.
    pub fn new(config: &DispatchConfig, submitter: Arc<dyn Submitter>) -> Result<Self, DispatchError> {
        config.validate()?;
        let worker_exe = match &config.worker.worker_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(DispatchError::WorkerExe)?,
        };
        Ok(Self {
            submitter,
            throttle: AdmissionThrottle::from_config(&config.throttle),
            walk: config.walk.clone(),
            worker: config.worker.clone(),
            worker_exe,
        })
    }

    /// Replace the throttle built from configuration.
    #[must_use]
    pub fn with_throttle(mut self, throttle: AdmissionThrottle) -> Self {
        self.throttle.shutdown();
        self.throttle = throttle;
        self
    }

    /// Stop background work owned by the dispatcher.
    pub fn shutdown(&self) {
        self.throttle.shutdown();
    }

    /// Probe `target_command` for addresses, then dispatch them.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Probe` if the probe cannot run and
    /// `DispatchError::EmptyCommand` for an empty target command.
    pub async fn probe_and_dispatch(
        &self,
        target_command: &[String],
    ) -> Result<DispatchReport, DispatchError> {
        if target_command.is_empty() {
            return Err(DispatchError::EmptyCommand);
        }
        let addresses = hierarchy::probe_addresses(target_command, &self.walk.probe_flag).await?;
        self.dispatch_addresses(&addresses, target_command).await
    }

    /// Dispatch a known address set. Each batch runs `target_command`
    /// through the `worker` subcommand.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::EmptyCommand` for an empty target command.
    pub async fn dispatch_addresses(
        &self,
        addresses: &[Address],
        target_command: &[String],
    ) -> Result<DispatchReport, DispatchError> {
        if target_command.is_empty() {
            return Err(DispatchError::EmptyCommand);
        }

        let mut report = DispatchReport::default();
        if addresses.is_empty() {
            warn!("no addresses to dispatch");
            return Ok(report);
        }

        let ledger = Mutex::new(DependencyLedger::from_addresses(addresses));
        let plan = planner::plan(addresses, self.walk.batch_size);
        info!(
            addresses = addresses.len(),
            batches = plan.batch_count(),
            batch_size = self.walk.batch_size,
            "planned dispatch"
        );

        for (depth, batches) in plan.levels() {
            let batches = if self.walk.only_first_batch {
                &batches[..1]
            } else {
                batches
            };
            info!(depth, batches = batches.len(), "dispatching depth");

            let results = join_all(
                batches
                    .iter()
                    .map(|batch| self.submit_address_batch(batch, &ledger, target_command)),
            )
            .await;
            for result in results {
                result.record(&mut report);
            }

            if self.walk.only_first_batch {
                info!("only_first_batch set, stopping after the first batch");
                break;
            }
        }

        Ok(report)
    }

    async fn submit_address_batch(
        &self,
        batch: &Batch,
        ledger: &Mutex<DependencyLedger<Address>>,
        target_command: &[String],
    ) -> BatchResult {
        let members = batch.member_ids();
        let holds = {
            let mut ledger = lock(ledger);
            if ledger.batch_blocked(batch.members()) {
                ledger.block_parents(batch.members());
                warn!(members = ?members, "skipping batch with a failed descendant");
                return BatchResult::Skipped(members);
            }
            ledger.batch_holds(batch.members())
        };

        let request = SubmitRequest {
            command: worker_invocation(&self.worker_exe, &self.worker, &members, target_command),
            members,
            holds,
        };
        let result = self.submit(request).await;

        let mut ledger = lock(ledger);
        match &result {
            BatchResult::Submitted(submitted) => ledger.record_batch(batch.members(), submitted.job),
            BatchResult::Failed(_) | BatchResult::Skipped(_) => ledger.block_parents(batch.members()),
        }
        result
    }

    /// Walk the directory tree under `root`, submitting `task <dir>` for
    /// every directory after all of its subdirectories.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RootNotFound` or
    /// `DispatchError::RootNotDirectory` for a bad root, and
    /// `DispatchError::EmptyCommand` for an empty task.
    pub async fn dispatch_tree(
        &self,
        task: &[String],
        root: &Path,
    ) -> Result<DispatchReport, DispatchError> {
        if task.is_empty() {
            return Err(DispatchError::EmptyCommand);
        }
        check_root(root).await?;

        info!(root = %root.display(), fanout = self.walk.fanout, "walking directory tree");

        let walk = TreeWalk {
            task,
            ledger: Mutex::new(DependencyLedger::new()),
            report: Mutex::new(DispatchReport::default()),
            first_taken: AtomicBool::new(false),
        };
        lock(&walk.ledger).insert(root.to_path_buf(), None);
        self.walk_dir(root.to_path_buf(), &walk).await;

        Ok(walk
            .report
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn walk_dir<'a>(&'a self, dir: PathBuf, walk: &'a TreeWalk<'a>) -> BoxFuture<'a, ()> {
        async move {
            let entries = match tree::read_entries(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot list directory; branch dropped");
                    return;
                },
            };

            let fanout = self.walk.fanout.max(1);
            let parent = &dir;
            stream::iter(entries)
                .map(|entry| async move {
                    match tree::is_directory(&entry).await {
                        Ok(true) => {
                            lock(&walk.ledger).insert(entry.clone(), Some(parent.clone()));
                            self.walk_dir(entry, walk).await;
                        },
                        Ok(false) => {},
                        Err(e) => {
                            warn!(path = %entry.display(), error = %e, "cannot stat entry; branch dropped");
                        },
                    }
                })
                .buffer_unordered(fanout)
                .collect::<Vec<()>>()
                .await;

            self.submit_directory(&dir, walk).await;
        }
        .boxed()
    }

    async fn submit_directory(&self, dir: &Path, walk: &TreeWalk<'_>) {
        let key = dir.to_path_buf();
        let members = vec![dir.display().to_string()];
        let holds = {
            let mut ledger = lock(&walk.ledger);
            if ledger.is_blocked(&key) {
                ledger.block_parents([&key]);
                warn!(dir = %dir.display(), "skipping directory with a failed subdirectory");
                drop(ledger);
                BatchResult::Skipped(members).record(&mut lock(&walk.report));
                return;
            }
            ledger.read_holds(&key)
        };

        if self.walk.only_first_batch && walk.first_taken.swap(true, Ordering::AcqRel) {
            debug!(dir = %dir.display(), "only_first_batch set, not submitting");
            return;
        }

        let request = SubmitRequest {
            command: directory_invocation(walk.task, dir),
            members,
            holds,
        };
        let result = self.submit(request).await;

        {
            let mut ledger = lock(&walk.ledger);
            match &result {
                BatchResult::Submitted(submitted) => {
                    ledger.record_hold(&key, submitted.job);
                },
                BatchResult::Failed(_) | BatchResult::Skipped(_) => ledger.block_parents([&key]),
            }
        }
        result.record(&mut lock(&walk.report));
    }

    /// Walk the directory tree under `root`, submitting `task <dir>` once for
    /// every leaf directory. Leaf jobs carry no holds.
    ///
    /// A root without subdirectories is itself the only leaf.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RootNotFound` or
    /// `DispatchError::RootNotDirectory` for a bad root, and
    /// `DispatchError::EmptyCommand` for an empty task.
    pub async fn dispatch_leaves(
        &self,
        task: &[String],
        root: &Path,
    ) -> Result<DispatchReport, DispatchError> {
        if task.is_empty() {
            return Err(DispatchError::EmptyCommand);
        }
        check_root(root).await?;

        info!(root = %root.display(), fanout = self.walk.fanout, "walking directory tree for leaves");

        let walk = LeafWalk {
            task,
            report: Mutex::new(DispatchReport::default()),
            first_taken: AtomicBool::new(false),
        };
        self.walk_leaves(root.to_path_buf(), &walk).await;

        Ok(walk
            .report
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn walk_leaves<'a>(&'a self, dir: PathBuf, walk: &'a LeafWalk<'a>) -> BoxFuture<'a, ()> {
        async move {
            let entries = match tree::read_entries(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot list directory; branch dropped");
                    return;
                },
            };

            let mut subdirs = Vec::new();
            let mut files = 0_usize;
            for entry in entries {
                match tree::is_directory(&entry).await {
                    Ok(true) => subdirs.push(entry),
                    Ok(false) => files += 1,
                    Err(e) => {
                        debug!(path = %entry.display(), error = %e, "cannot stat entry; treated as a file");
                        files += 1;
                    },
                }
            }

            if subdirs.is_empty() {
                self.submit_leaf(&dir, walk).await;
                return;
            }
            if files > 0 {
                debug!(dir = %dir.display(), files, "not submitting files of a branch directory");
            }

            stream::iter(subdirs)
                .map(|sub| self.walk_leaves(sub, walk))
                .buffer_unordered(self.walk.fanout.max(1))
                .collect::<Vec<()>>()
                .await;
        }
        .boxed()
    }

    async fn submit_leaf(&self, dir: &Path, walk: &LeafWalk<'_>) {
        if self.walk.only_first_batch && walk.first_taken.swap(true, Ordering::AcqRel) {
            debug!(dir = %dir.display(), "only_first_batch set, not submitting");
            return;
        }

        let request = SubmitRequest {
            command: directory_invocation(walk.task, dir),
            members: vec![dir.display().to_string()],
            holds: BTreeSet::new(),
        };
        self.submit(request).await.record(&mut lock(&walk.report));
    }

    /// Admit, submit, and classify one request.
    async fn submit(&self, request: SubmitRequest) -> BatchResult {
        let _permit = self.throttle.admit().await;
        match self.submitter.submit(&request).await {
            Ok(job) => {
                info!(
                    %job,
                    members = ?request.members,
                    holds = request.holds.len(),
                    "submitted batch"
                );
                BatchResult::Submitted(SubmittedBatch {
                    members: request.members,
                    holds: request.holds,
                    job,
                })
            },
            Err(e) => {
                warn!(members = ?request.members, error = %e, "submission failed; ancestors will be skipped");
                BatchResult::Failed(FailedBatch {
                    members: request.members,
                    error: e.to_string(),
                })
            },
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.throttle.shutdown();
    }
}

/// Shared state of one directory walk.
struct TreeWalk<'a> {
    task: &'a [String],
    ledger: Mutex<DependencyLedger<PathBuf>>,
    report: Mutex<DispatchReport>,
    first_taken: AtomicBool,
}

/// Shared state of one leaf walk.
struct LeafWalk<'a> {
    task: &'a [String],
    report: Mutex<DispatchReport>,
    first_taken: AtomicBool,
}
