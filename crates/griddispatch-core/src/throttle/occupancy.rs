//! Occupancy-polling admission.
//!
//! Waiters queue a oneshot ticket. A background task polls the scheduler
//! every `poll_interval` for the caller's current job count and, while that
//! count is below `threshold`, releases up to `threshold - count` tickets in
//! arrival order. The first poll happens one interval after start.

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors from one occupancy poll.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OccupancyError {
    /// The occupancy command line was empty.
    #[error("occupancy command is empty")]
    EmptyCommand,

    /// The occupancy command could not be started.
    #[error("failed to spawn occupancy command '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The occupancy command exited unsuccessfully.
    #[error("occupancy command failed ({status})")]
    Failed {
        /// Exit status as reported by the OS.
        status: String,
    },

    /// The command's stdout was not a single non-negative integer.
    #[error("occupancy command printed {output:?}, expected a job count")]
    Unparsable {
        /// Captured stdout.
        output: String,
    },
}

/// Source of the caller's current scheduler job count.
#[async_trait]
pub trait OccupancyProbe: Send + Sync + fmt::Debug {
    /// Jobs the caller currently has queued or running.
    async fn job_count(&self) -> Result<u64, OccupancyError>;
}

/// Runs an external command that prints the job count on stdout.
#[derive(Debug, Clone)]
pub struct CommandOccupancyProbe {
    command: Vec<String>,
}

impl CommandOccupancyProbe {
    /// Create a probe running `command`.
    #[must_use]
    pub const fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl OccupancyProbe for CommandOccupancyProbe {
    async fn job_count(&self) -> Result<u64, OccupancyError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(OccupancyError::EmptyCommand)?;

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| OccupancyError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(OccupancyError::Failed {
                status: output.status.to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse()
            .map_err(|_| OccupancyError::Unparsable {
                output: stdout.into_owned(),
            })
    }
}

#[derive(Debug, Default)]
struct TicketQueue {
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl TicketQueue {
    fn push(&self, ticket: oneshot::Sender<()>) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ticket);
    }

    fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Release up to `budget` live waiters, oldest first.
    ///
    /// Tickets whose waiter has gone away do not consume budget.
    fn release(&self, budget: u64) -> u64 {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut released = 0;
        while released < budget {
            let Some(ticket) = waiters.pop_front() else {
                break;
            };
            if ticket.send(()).is_ok() {
                released += 1;
            }
        }
        released
    }
}

/// Admission gated on the scheduler's reported occupancy.
#[derive(Debug)]
pub struct OccupancyThrottle {
    queue: Arc<TicketQueue>,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl OccupancyThrottle {
    /// Start polling `probe` every `poll_interval`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(probe: Arc<dyn OccupancyProbe>, threshold: u64, poll_interval: Duration) -> Self {
        let queue = Arc::new(TicketQueue::default());
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(poll_loop(
            probe,
            Arc::clone(&queue),
            threshold,
            poll_interval,
            cancel.clone(),
        ));
        Self {
            queue,
            cancel,
            poller: Mutex::new(Some(poller)),
        }
    }

    /// Wait for the poller to release this caller.
    pub async fn admit(&self) {
        let (tx, rx) = oneshot::channel();
        self.queue.push(tx);
        if rx.await.is_err() {
            // Only reachable once the queue itself is gone.
            debug!("occupancy queue dropped; admitting without release");
        }
    }

    /// Callers currently waiting for release.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop the poller. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for OccupancyThrottle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn poll_loop(
    probe: Arc<dyn OccupancyProbe>,
    queue: Arc<TicketQueue>,
    threshold: u64,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        let waiting = queue.len();
        if waiting == 0 {
            continue;
        }

        match probe.job_count().await {
            Ok(count) if count < threshold => {
                let released = queue.release(threshold - count);
                debug!(count, threshold, waiting, released, "occupancy poll");
            },
            Ok(count) => {
                debug!(count, threshold, waiting, "scheduler at capacity");
            },
            Err(e) => {
                warn!(error = %e, waiting, "occupancy poll failed, releasing nothing");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays a fixed sequence of poll results, then reports errors.
    #[derive(Debug)]
    struct ScriptedProbe {
        replies: Mutex<VecDeque<Result<u64, ()>>>,
        polls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(replies: Vec<Result<u64, ()>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OccupancyProbe for ScriptedProbe {
        async fn job_count(&self) -> Result<u64, OccupancyError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(count)) => Ok(count),
                _ => Err(OccupancyError::Failed {
                    status: "exit status: 1".to_string(),
                }),
            }
        }
    }

    fn spawn_waiters(
        throttle: &Arc<OccupancyThrottle>,
        n: usize,
    ) -> Arc<AtomicUsize> {
        let admitted = Arc::new(AtomicUsize::new(0));
        for _ in 0..n {
            let throttle = Arc::clone(throttle);
            let admitted = Arc::clone(&admitted);
            tokio::spawn(async move {
                throttle.admit().await;
                admitted.fetch_add(1, Ordering::SeqCst);
            });
        }
        admitted
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_bounded_by_headroom() {
        let probe = ScriptedProbe::new(vec![Ok(3), Ok(5), Ok(0)]);
        let throttle = Arc::new(OccupancyThrottle::start(
            probe.clone(),
            5,
            Duration::from_secs(5),
        ));
        let admitted = spawn_waiters(&throttle, 10);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(throttle.queued(), 10);
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        // t=5: count 3, headroom 2.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 2);

        // t=10: at threshold, nothing released.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 2);

        // t=15: empty scheduler, a full threshold's worth.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 7);
        assert_eq!(throttle.queued(), 3);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 3);

        throttle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_releases_nothing() {
        let probe = ScriptedProbe::new(vec![Err(()), Ok(0)]);
        let throttle = Arc::new(OccupancyThrottle::start(
            probe,
            4,
            Duration::from_secs(1),
        ));
        let admitted = spawn_waiters(&throttle, 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_skips_probe() {
        let probe = ScriptedProbe::new(vec![Ok(0)]);
        let throttle = OccupancyThrottle::start(probe.clone(), 4, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.polls.load(Ordering::SeqCst), 0);
        throttle.shutdown();
        throttle.shutdown();
    }

    #[test]
    fn test_release_skips_abandoned_tickets() {
        let queue = TicketQueue::default();
        let (gone, gone_rx) = oneshot::channel();
        let (live, mut live_rx) = oneshot::channel();
        drop(gone_rx);
        queue.push(gone);
        queue.push(live);

        assert_eq!(queue.release(1), 1);
        assert!(live_rx.try_recv().is_ok());
        assert_eq!(queue.len(), 0);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_command_probe_parses_count() {
        let probe = CommandOccupancyProbe::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo ' 42 '".to_string(),
        ]);
        assert_eq!(probe.job_count().await.unwrap(), 42);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_command_probe_rejects_garbage() {
        let probe = CommandOccupancyProbe::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo many".to_string(),
        ]);
        assert!(matches!(
            probe.job_count().await,
            Err(OccupancyError::Unparsable { .. })
        ));

        let failing = CommandOccupancyProbe::new(vec!["false".to_string()]);
        assert!(matches!(
            failing.job_count().await,
            Err(OccupancyError::Failed { .. })
        ));

        let empty = CommandOccupancyProbe::new(Vec::new());
        assert!(matches!(
            empty.job_count().await,
            Err(OccupancyError::EmptyCommand)
        ));
    }
}
