//! What a dispatch run did.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::submit::JobId;

/// A batch the scheduler accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBatch {
    /// Node ids covered by the job.
    pub members: Vec<String>,
    /// Job ids the job holds on.
    pub holds: BTreeSet<JobId>,
    /// The scheduler's id for the job.
    pub job: JobId,
}

/// A batch whose submission failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatch {
    /// Node ids that were not submitted.
    pub members: Vec<String>,
    /// Why the submission failed.
    pub error: String,
}

/// Outcome of one dispatch run.
///
/// Batches appear in submission order for address mode and in completion
/// order for directory mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Accepted batches.
    pub submitted: Vec<SubmittedBatch>,
    /// Batches the scheduler refused or that could not be submitted.
    pub failed: Vec<FailedBatch>,
    /// Batches not submitted because a descendant failed or was skipped.
    pub skipped: Vec<Vec<String>>,
    /// Submitted batch size → number of batches with that size.
    pub batch_size_histogram: BTreeMap<usize, usize>,
}

impl DispatchReport {
    pub(crate) fn record_submitted(&mut self, batch: SubmittedBatch) {
        *self
            .batch_size_histogram
            .entry(batch.members.len())
            .or_default() += 1;
        self.submitted.push(batch);
    }

    /// Whether every planned batch was submitted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Number of node ids covered by submitted jobs.
    #[must_use]
    pub fn submitted_nodes(&self) -> usize {
        self.submitted.iter().map(|b| b.members.len()).sum()
    }

    /// The job covering `member`, if it was submitted.
    #[must_use]
    pub fn job_for(&self, member: &str) -> Option<JobId> {
        self.submitted
            .iter()
            .find(|b| b.members.iter().any(|m| m == member))
            .map(|b| b.job)
    }

    /// The submitted batch covering `member`.
    #[must_use]
    pub fn batch_for(&self, member: &str) -> Option<&SubmittedBatch> {
        self.submitted
            .iter()
            .find(|b| b.members.iter().any(|m| m == member))
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "COUNT {} jobs covering {} nodes ({} failed, {} skipped)",
            self.submitted.len(),
            self.submitted_nodes(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for (size, count) in &self.batch_size_histogram {
            writeln!(f, "  batch size {size}: {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(members: &[&str], job: u64) -> SubmittedBatch {
        SubmittedBatch {
            members: members.iter().map(|m| (*m).to_string()).collect(),
            holds: BTreeSet::new(),
            job: JobId::new(job),
        }
    }

    #[test]
    fn test_histogram_and_summary() {
        let mut report = DispatchReport::default();
        report.record_submitted(batch(&["11", "12"], 1));
        report.record_submitted(batch(&["13", "14"], 2));
        report.record_submitted(batch(&["1"], 3));

        assert_eq!(report.batch_size_histogram, BTreeMap::from([(1, 1), (2, 2)]));
        assert_eq!(report.submitted_nodes(), 5);
        assert_eq!(report.job_for("14"), Some(JobId::new(2)));
        assert_eq!(report.job_for("0"), None);
        assert!(report.is_complete());

        let text = report.to_string();
        assert!(text.starts_with("COUNT 3 jobs covering 5 nodes (0 failed, 0 skipped)"));
        assert!(text.contains("batch size 2: 2"));
    }
}
