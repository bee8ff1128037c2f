//! Fixed-size worker pool over a shared job queue.
//!
//! Each worker claims a job and drives it through its retries before taking the next
//! one, so at most `max_workers` jobs are ever `in_progress`. A fatal condition stops
//! all workers from claiming further jobs; ordinary failures stay local to their job.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::DownloadConfig;
use crate::error::CuratorError;
use crate::jobs::DownloadJob;
use crate::ledger::{DownloadReportEntry, Ledger};
use crate::ratelimit::{RateLimiter, Sleeper, ThreadSleeper};
use crate::retry::{FailureKind, JobState, RetryPolicy};
use crate::transfer::{TransferClient, TransferError};
use crate::verify::{ChecksumOutcome, IntegrityError, Verification, Verifier};

pub const STAGING_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub total_jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub peak_in_progress: usize,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub jobs: Vec<DownloadJob>,
}

pub fn staging_path(destination: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{destination}{STAGING_SUFFIX}"))
}

pub struct Scheduler<T, S = ThreadSleeper> {
    transfers: T,
    sleeper: S,
    limiter: RateLimiter,
    policy: RetryPolicy,
    verifier: Verifier,
    max_workers: usize,
}

impl<T: TransferClient> Scheduler<T> {
    pub fn new(transfers: T, config: &DownloadConfig) -> Self {
        Self {
            transfers,
            sleeper: ThreadSleeper,
            limiter: RateLimiter::per_second(config.requests_per_second),
            policy: RetryPolicy::from_config(config),
            verifier: Verifier::new(config.validate_gzip),
            max_workers: config.max_workers.max(1),
        }
    }
}

impl<T: TransferClient, S: Sleeper> Scheduler<T, S> {
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> Scheduler<T, S2> {
        Scheduler {
            transfers: self.transfers,
            sleeper,
            limiter: self.limiter,
            policy: self.policy,
            verifier: self.verifier,
            max_workers: self.max_workers,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn transfers(&self) -> &T {
        &self.transfers
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs every job to a terminal state, or stops early on a fatal condition.
    pub fn run(
        &self,
        jobs: Vec<DownloadJob>,
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, CuratorError> {
        let started = Instant::now();
        let total_jobs = jobs.len();
        let workers = self.max_workers.min(total_jobs).max(1);
        let state = RunState::new(jobs);

        tracing::info!(jobs = total_jobs, workers, "download started");
        sink.event(ProgressEvent {
            message: format!("phase=Download; {total_jobs} jobs on {workers} workers"),
            elapsed: None,
        });

        let panicked = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let state = &state;
                    scope.spawn(move || self.work(worker, state, ledger, sink))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .filter(Result::is_err)
                .count()
        });
        if panicked > 0 {
            return Err(CuratorError::WorkerPanic);
        }

        let RunState {
            fatal,
            finished,
            peak,
            ..
        } = state;
        if let Some(err) = fatal.into_inner().unwrap_or_else(PoisonError::into_inner) {
            tracing::error!(%err, "download aborted");
            return Err(err);
        }

        let mut jobs = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        jobs.sort_by(|a, b| (&a.sample, a.part).cmp(&(&b.sample, b.part)));
        let succeeded = jobs
            .iter()
            .filter(|job| job.state == JobState::Succeeded)
            .count();
        let summary = DownloadSummary {
            total_jobs,
            succeeded,
            failed: jobs.len() - succeeded,
            peak_in_progress: peak.into_inner(),
            elapsed_ms: millis(started.elapsed()),
            jobs,
        };
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            peak = summary.peak_in_progress,
            "download finished"
        );
        Ok(summary)
    }

    fn work(&self, worker: usize, state: &RunState, ledger: &Ledger, sink: &dyn ProgressSink) {
        while !state.aborted() {
            let Some(job) = state.next_job() else {
                break;
            };
            match self.process(job, state, ledger, sink) {
                Ok(Some(job)) => state.finish(job),
                Ok(None) => {}
                Err(err) => state.abort(err),
            }
        }
        tracing::debug!(worker, "worker exiting");
    }

    /// `Ok(None)` when the run was aborted before the job reached a terminal state.
    fn process(
        &self,
        mut job: DownloadJob,
        state: &RunState,
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<Option<DownloadJob>, CuratorError> {
        let started = Instant::now();
        let mut checksum = ChecksumOutcome::NotChecked;

        loop {
            let delay = self.policy.delay_before(job.attempt_count + 1);
            if !delay.is_zero() {
                tracing::info!(job = %job.label(), delay_ms = millis(delay), "backing off");
                self.sleeper.sleep(delay);
            }
            if state.aborted() {
                return Ok(None);
            }

            job.claim()?;
            let outcome = {
                let _slot = state.enter();
                sink.event(ProgressEvent {
                    message: format!("{} attempt {}", job.label(), job.attempt_count),
                    elapsed: None,
                });
                self.limiter.acquire(&self.sleeper);
                self.attempt(&job)
            };

            match outcome {
                Ok(verification) => {
                    checksum = verification.outcome;
                    job.succeed(Some(verification.observed_checksum))?;
                }
                Err(AttemptFailure::Fatal(message)) => {
                    job.fail(&self.policy, FailureKind::Permanent, message.clone())?;
                    self.record(&job, checksum, started, ledger, sink)?;
                    return Err(CuratorError::ResourceExhausted(message));
                }
                Err(AttemptFailure::Failed {
                    kind,
                    message,
                    checksum: attempt_checksum,
                    observed,
                }) => {
                    checksum = attempt_checksum;
                    if observed.is_some() {
                        job.observed_checksum = observed;
                    }
                    tracing::warn!(
                        job = %job.label(),
                        attempt = job.attempt_count,
                        error = %message,
                        "attempt failed"
                    );
                    if job.fail(&self.policy, kind, message)? == JobState::FailedRetryable {
                        sink.event(ProgressEvent {
                            message: format!("{} {}", job.label(), job.state),
                            elapsed: None,
                        });
                        job.requeue()?;
                        continue;
                    }
                }
            }

            self.record(&job, checksum, started, ledger, sink)?;
            return Ok(Some(job));
        }
    }

    fn attempt(&self, job: &DownloadJob) -> Result<Verification, AttemptFailure> {
        if let Some(parent) = job.destination.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TransferError::from_io(&err, "create destination directory"))?;
        }
        let staging = staging_path(&job.destination);
        remove_stale(&staging);

        if let Err(err) = self.transfers.fetch(job, &staging) {
            remove_stale(&staging);
            return Err(err.into());
        }

        let gzip = job.destination.extension() == Some("gz");
        let verification = match self.verifier.verify(
            staging.as_std_path(),
            job.expected_checksum.as_deref(),
            gzip,
        ) {
            Ok(verification) => verification,
            Err(err) => {
                remove_stale(&staging);
                return Err(AttemptFailure::integrity(err));
            }
        };

        fs::rename(staging.as_std_path(), job.destination.as_std_path())
            .map_err(|err| TransferError::from_io(&err, "move artifact into place"))?;
        Ok(verification)
    }

    fn record(
        &self,
        job: &DownloadJob,
        checksum: ChecksumOutcome,
        started: Instant,
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<(), CuratorError> {
        let elapsed = started.elapsed();
        ledger.append(&DownloadReportEntry::from_job(job, checksum, millis(elapsed)))?;
        if job.state == JobState::Succeeded {
            tracing::info!(job = %job.label(), attempts = job.attempt_count, "download succeeded");
        } else {
            tracing::warn!(
                job = %job.label(),
                attempts = job.attempt_count,
                error = job.last_error.as_deref().unwrap_or_default(),
                "download failed"
            );
        }
        sink.event(ProgressEvent {
            message: format!("{} {}", job.label(), job.state),
            elapsed: Some(elapsed),
        });
        Ok(())
    }
}

enum AttemptFailure {
    Failed {
        kind: FailureKind,
        message: String,
        checksum: ChecksumOutcome,
        observed: Option<String>,
    },
    Fatal(String),
}

impl AttemptFailure {
    fn integrity(err: IntegrityError) -> Self {
        let checksum = match err {
            IntegrityError::Mismatch { .. } => ChecksumOutcome::Mismatch,
            _ => ChecksumOutcome::NotChecked,
        };
        AttemptFailure::Failed {
            kind: FailureKind::Integrity,
            observed: err.observed_checksum().map(str::to_string),
            message: err.to_string(),
            checksum,
        }
    }
}

impl From<TransferError> for AttemptFailure {
    fn from(err: TransferError) -> Self {
        let message = err.to_string();
        let kind = match err {
            TransferError::Fatal(_) => return AttemptFailure::Fatal(message),
            TransferError::Transient(_) => FailureKind::Transient,
            TransferError::Permanent(_) => FailureKind::Permanent,
        };
        AttemptFailure::Failed {
            kind,
            message,
            checksum: ChecksumOutcome::NotChecked,
            observed: None,
        }
    }
}

struct RunState {
    queue: Mutex<VecDeque<DownloadJob>>,
    finished: Mutex<Vec<DownloadJob>>,
    fatal: Mutex<Option<CuratorError>>,
    stop: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RunState {
    fn new(jobs: Vec<DownloadJob>) -> Self {
        Self {
            queue: Mutex::new(jobs.into()),
            finished: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            stop: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn next_job(&self) -> Option<DownloadJob> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn finish(&self, job: DownloadJob) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
    }

    fn aborted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Keeps the first fatal error.
    fn abort(&self, err: CuratorError) {
        self.stop.store(true, Ordering::SeqCst);
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn remove_stale(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(%path, %err, "could not remove staging file");
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
