//! Per-job state machine and backoff policy.
//!
//! ```text
//! pending -> in_progress -> succeeded
//!                        -> failed_retryable -> pending
//!                        -> failed_permanent
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DownloadConfig;
use crate::error::CuratorError;
use crate::jobs::DownloadJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress => "in_progress",
            JobState::Succeeded => "succeeded",
            JobState::FailedRetryable => "failed_retryable",
            JobState::FailedPermanent => "failed_permanent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedPermanent)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::InProgress)
                | (JobState::InProgress, JobState::Succeeded)
                | (JobState::InProgress, JobState::FailedRetryable)
                | (JobState::InProgress, JobState::FailedPermanent)
                | (JobState::FailedRetryable, JobState::Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network errors, timeouts, throttling, tool exit failures.
    Transient,
    /// Checksum mismatch or an empty/truncated artifact.
    Integrity,
    /// Resource not found, access denied, unknown accession.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }

    /// Wait before starting attempt `attempt` (1-based): zero for the first,
    /// `base_delay * 2^(attempt - 2)` afterwards.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.delay_after_failure(attempt - 1)
    }

    /// Backoff after attempt number `attempt_count` failed.
    pub fn delay_after_failure(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// State that follows a failed attempt.
    pub fn next_state(&self, attempt_count: u32, failure: FailureKind) -> JobState {
        if failure.is_retryable() && attempt_count < self.max_attempts {
            JobState::FailedRetryable
        } else {
            JobState::FailedPermanent
        }
    }
}

impl DownloadJob {
    fn transition(&mut self, next: JobState) -> Result<(), CuratorError> {
        if !self.state.can_transition_to(next) {
            return Err(CuratorError::InvalidTransition {
                job: self.label(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// `pending -> in_progress`, counting the attempt.
    pub fn claim(&mut self) -> Result<(), CuratorError> {
        self.transition(JobState::InProgress)?;
        self.attempt_count += 1;
        Ok(())
    }

    pub fn succeed(&mut self, observed_checksum: Option<String>) -> Result<(), CuratorError> {
        self.transition(JobState::Succeeded)?;
        self.observed_checksum = observed_checksum;
        self.last_error = None;
        Ok(())
    }

    /// Records the failure and moves to the state `policy` dictates.
    pub fn fail(
        &mut self,
        policy: &RetryPolicy,
        failure: FailureKind,
        message: String,
    ) -> Result<JobState, CuratorError> {
        let next = policy.next_state(self.attempt_count, failure);
        self.transition(next)?;
        self.last_error = Some(message);
        Ok(next)
    }

    /// `failed_retryable -> pending`.
    pub fn requeue(&mut self) -> Result<(), CuratorError> {
        self.transition(JobState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::{Accession, ReadPart, SampleKey, Source};
    use crate::jobs::Protocol;

    fn job() -> DownloadJob {
        DownloadJob::new(
            SampleKey {
                source: Source::Sra,
                accession: Accession::parse(Source::Sra, "SRR1").unwrap(),
            },
            ReadPart::Single,
            Protocol::SequenceDump,
            "sra://SRR1".to_string(),
            Utf8PathBuf::from("root/breast/single-end/SRR1.fastq.gz"),
            None,
        )
    }

    #[test]
    fn default_backoff_is_zero_two_four() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=3)
            .map(|attempt| policy.delay_before(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 2, 4]);
    }

    #[test]
    fn retry_loop_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        let mut job = job();
        for attempt in 1..=3 {
            job.claim().unwrap();
            assert_eq!(job.attempt_count, attempt);
            let next = job
                .fail(&policy, FailureKind::Transient, "timeout".to_string())
                .unwrap();
            if attempt < 3 {
                assert_eq!(next, JobState::FailedRetryable);
                job.requeue().unwrap();
            } else {
                assert_eq!(next, JobState::FailedPermanent);
            }
        }
        assert!(job.state.is_terminal());
        assert_matches!(job.claim(), Err(CuratorError::InvalidTransition { .. }));
    }

    #[test]
    fn permanent_failure_is_terminal_on_first_attempt() {
        let policy = RetryPolicy::default();
        let mut job = job();
        job.claim().unwrap();
        let next = job
            .fail(&policy, FailureKind::Permanent, "404".to_string())
            .unwrap();
        assert_eq!(next, JobState::FailedPermanent);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn cannot_succeed_without_claim() {
        let mut job = job();
        assert!(job.succeed(None).is_err());
        assert_eq!(job.state, JobState::Pending);
    }
}
