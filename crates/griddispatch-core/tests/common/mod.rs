//! Shared fixtures for dispatch integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use griddispatch_core::config::DispatchConfig;
use griddispatch_core::submit::{JobId, SubmitError, SubmitRequest, Submitter};

/// Records every request, hands out ids from 100 upward, and tracks how
/// many submissions overlap.
#[derive(Debug)]
pub struct RecordingSubmitter {
    requests: Mutex<Vec<(SubmitRequest, JobId)>>,
    next: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    fail_suffixes: Vec<String>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            next: AtomicU64::new(100),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_suffixes: Vec::new(),
        }
    }

    /// Each submission takes `delay` to complete.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject any batch with a member ending in `suffix`.
    pub fn failing_on(mut self, suffix: &str) -> Self {
        self.fail_suffixes.push(suffix.to_string());
        self
    }

    /// Accepted requests with their ids, in completion order.
    pub fn accepted(&self) -> Vec<(SubmitRequest, JobId)> {
        self.requests.lock().unwrap().clone()
    }

    /// Member lists of accepted requests, in completion order.
    pub fn member_order(&self) -> Vec<String> {
        self.accepted()
            .iter()
            .map(|(req, _)| req.members.join(","))
            .collect()
    }

    /// Most submissions observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Submitter for RecordingSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<JobId, SubmitError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let rejected = request
            .members
            .iter()
            .any(|m| self.fail_suffixes.iter().any(|s| m.ends_with(s.as_str())));
        if rejected {
            return Err(SubmitError::Rejected {
                status: "exit status: 1".to_string(),
                stderr: "Unable to run job".to_string(),
            });
        }

        let job = JobId::new(self.next.fetch_add(1, Ordering::SeqCst));
        self.requests.lock().unwrap().push((request.clone(), job));
        Ok(job)
    }
}

/// Default configuration with a fixed worker executable.
pub fn test_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.worker.worker_exe = Some(PathBuf::from("/usr/local/bin/griddispatch"));
    config
}

pub fn strings(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| (*s).to_string()).collect()
}
