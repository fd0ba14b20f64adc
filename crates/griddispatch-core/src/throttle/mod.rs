//! Admission throttling for scheduler submissions.
//!
//! Submitting is an expensive external call and a shared cluster punishes
//! floods, so every submission first waits for admission. Two policies are
//! available, selected by configuration:
//!
//! - **Counting** ([`CountingThrottle`]): at most `max_in_flight`
//!   submissions between admission and completion. Callers that find no free
//!   slot sleep `retry_delay` and try again.
//! - **Occupancy** ([`OccupancyThrottle`]): a background poller asks the
//!   scheduler how many jobs the caller already has and releases queued
//!   callers, FIFO, while that count is below a threshold.
//!
//! Both policies hand out an [`AdmissionPermit`]. The throttle knows nothing
//! about what the caller does while holding it.
//!
//! # Invariants
//!
//! - [INV-THR-001] The counting policy never has more than `max_in_flight`
//!   permits alive at once.
//! - [INV-THR-002] One occupancy poll releases at most `threshold - count`
//!   waiters.
//! - [INV-THR-003] A failed occupancy poll releases nothing.

mod occupancy;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub use occupancy::{CommandOccupancyProbe, OccupancyError, OccupancyProbe, OccupancyThrottle};
use tracing::trace;

use crate::config::ThrottleConfig;

/// The configured admission policy.
#[derive(Debug)]
pub enum AdmissionThrottle {
    /// Local in-flight counter.
    Counting(CountingThrottle),
    /// Scheduler occupancy polling.
    Occupancy(OccupancyThrottle),
}

impl AdmissionThrottle {
    /// Build the throttle described by `config`.
    ///
    /// The occupancy policy starts its poller immediately, so this must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn from_config(config: &ThrottleConfig) -> Self {
        match config {
            ThrottleConfig::Counting {
                max_in_flight,
                retry_delay,
            } => Self::Counting(CountingThrottle::new(*max_in_flight, *retry_delay)),
            ThrottleConfig::Occupancy {
                threshold,
                poll_interval,
                command,
            } => Self::Occupancy(OccupancyThrottle::start(
                Arc::new(CommandOccupancyProbe::new(command.clone())),
                *threshold,
                *poll_interval,
            )),
        }
    }

    /// Wait until a submission may proceed.
    pub async fn admit(&self) -> AdmissionPermit<'_> {
        match self {
            Self::Counting(throttle) => AdmissionPermit::Counted(throttle.acquire().await),
            Self::Occupancy(throttle) => {
                throttle.admit().await;
                AdmissionPermit::Released
            },
        }
    }

    /// Stop background polling. Idempotent.
    pub fn shutdown(&self) {
        if let Self::Occupancy(throttle) = self {
            throttle.shutdown();
        }
    }
}

/// Proof of admission. Dropping it ends the submission's in-flight window.
#[derive(Debug)]
#[must_use = "the submission is only throttled while the permit is held"]
pub enum AdmissionPermit<'a> {
    /// Holds a slot of a counting throttle.
    Counted(CountingPermit<'a>),
    /// Released by the occupancy poller; nothing to give back.
    Released,
}

/// Bounds in-flight submissions with a local counter.
#[derive(Debug)]
pub struct CountingThrottle {
    in_flight: AtomicUsize,
    max_in_flight: usize,
    retry_delay: Duration,
}

impl CountingThrottle {
    /// Create a throttle admitting at most `max_in_flight` at a time.
    #[must_use]
    pub const fn new(max_in_flight: usize, retry_delay: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            max_in_flight,
            retry_delay,
        }
    }

    /// Number of permits currently alive.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<CountingPermit<'_>> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_in_flight).then_some(current + 1)
            })
            .ok()
            .map(|_| CountingPermit { throttle: self })
    }

    /// Take a slot, sleeping `retry_delay` between attempts.
    pub async fn acquire(&self) -> CountingPermit<'_> {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            trace!(
                in_flight = self.in_flight(),
                max = self.max_in_flight,
                "throttle full, deferring submission"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

/// A held slot of a [`CountingThrottle`].
#[derive(Debug)]
pub struct CountingPermit<'a> {
    throttle: &'a CountingThrottle,
}

impl Drop for CountingPermit<'_> {
    fn drop(&mut self) {
        self.throttle.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
