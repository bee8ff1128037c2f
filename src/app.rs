use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::consolidate::{Consolidation, Consolidator, MANIFEST_FILE};
use crate::error::CuratorError;
use crate::jobs::{BuildOptions, FsArtifacts, build_jobs};
use crate::ledger::{
    DOWNLOAD_REPORT_FILE, FAILED_DOWNLOADS_FILE, Ledger, failed_parts, read_entries,
    write_failed_downloads,
};
use crate::manifest::read_manifest;
use crate::ratelimit::{Sleeper, ThreadSleeper};
use crate::retry::JobState;
use crate::scheduler::{DownloadSummary, Scheduler};
use crate::transfer::TransferClient;

/// Outcome of a phase that did not fail fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Complete,
    /// Finished, but with missing sources or failed jobs.
    Partial,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub limit: Option<usize>,
    /// Only re-attempt parts whose last ledger entry is a permanent failure.
    pub retry_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateResult {
    pub status: PhaseStatus,
    pub samples: usize,
    pub duplicate_groups: usize,
    pub samples_in_duplicate_groups: usize,
    pub label_conflicts: usize,
    pub normalization_issues: usize,
    pub warnings: Vec<String>,
    pub outputs: Vec<String>,
}

impl ConsolidateResult {
    fn new(consolidation: &Consolidation, outputs: Vec<Utf8PathBuf>) -> Self {
        let summary = &consolidation.summary;
        Self {
            status: consolidation.status,
            samples: summary.total_samples,
            duplicate_groups: summary.duplicate_groups,
            samples_in_duplicate_groups: summary.samples_in_duplicate_groups,
            label_conflicts: summary.label_conflicts,
            normalization_issues: summary.normalization_issues,
            warnings: consolidation
                .warnings
                .iter()
                .map(|warning| format!("{}: {}", warning.source, warning.message))
                .collect(),
            outputs: outputs.into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDownload {
    pub accession: String,
    pub part: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub status: PhaseStatus,
    pub summary: DownloadSummary,
    pub failures: Vec<FailedDownload>,
    pub ledger: String,
    pub failed_list: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub consolidate: ConsolidateResult,
    pub download: DownloadResult,
}

pub struct App<T: TransferClient, S: Sleeper = ThreadSleeper> {
    config: ResolvedConfig,
    scheduler: Scheduler<T, S>,
}

impl<T: TransferClient> App<T> {
    pub fn new(config: ResolvedConfig, transfers: T) -> Self {
        let scheduler = Scheduler::new(transfers, &config.download);
        Self { config, scheduler }
    }
}

impl<T: TransferClient, S: Sleeper> App<T, S> {
    pub fn with_scheduler(config: ResolvedConfig, scheduler: Scheduler<T, S>) -> Self {
        Self { config, scheduler }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler<T, S> {
        &self.scheduler
    }

    pub fn consolidate(&self, sink: &dyn ProgressSink) -> Result<ConsolidateResult, CuratorError> {
        let started = Instant::now();
        let data_dir = &self.config.paths.data_dir;
        sink.event(ProgressEvent {
            message: format!("phase=Consolidate; reading tables from {data_dir}"),
            elapsed: None,
        });

        let tables = Consolidator::load_tables(data_dir)?;
        let consolidation = Consolidator::new(&self.config).consolidate(tables)?;
        let outputs = Consolidator::write_outputs(data_dir, &consolidation)?;

        sink.event(ProgressEvent {
            message: format!(
                "phase=Consolidate; {} samples, {} duplicate groups",
                consolidation.summary.total_samples, consolidation.summary.duplicate_groups
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(ConsolidateResult::new(&consolidation, outputs))
    }

    pub fn download(
        &self,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, CuratorError> {
        let paths = &self.config.paths;
        let manifest_path = paths.data_dir.join(MANIFEST_FILE);
        let ledger_path = paths.report_dir.join(DOWNLOAD_REPORT_FILE);
        sink.event(ProgressEvent {
            message: format!("phase=Plan; reading {manifest_path}"),
            elapsed: None,
        });

        let manifest = read_manifest(manifest_path.as_std_path())?;
        let only = if options.retry_failed {
            let failed = failed_parts(&read_entries(ledger_path.as_std_path())?);
            tracing::info!(parts = failed.len(), "retrying failed parts from ledger");
            Some(failed)
        } else {
            None
        };
        let build = BuildOptions {
            limit: options.limit.or(self.config.download.sample_limit),
            only,
        };
        let jobs = build_jobs(&manifest, &paths.download_root, &FsArtifacts, &build);
        tracing::info!(
            samples = manifest.len(),
            jobs = jobs.len(),
            root = %paths.download_root,
            "planned downloads"
        );

        let ledger = Ledger::open(ledger_path.as_std_path())?;
        let summary = self.scheduler.run(jobs, &ledger, sink)?;

        let failures: Vec<FailedDownload> = summary
            .jobs
            .iter()
            .filter(|job| job.state != JobState::Succeeded)
            .map(|job| FailedDownload {
                accession: job.sample.accession.to_string(),
                part: job.part.to_string(),
                error: job.last_error.clone().unwrap_or_default(),
            })
            .collect();
        drop(ledger);
        let failed_path = paths.report_dir.join(FAILED_DOWNLOADS_FILE);
        let entries = read_entries(ledger_path.as_std_path())?;
        let failed_list = write_failed_downloads(failed_path.as_std_path(), &entries)?
            .then(|| failed_path.to_string());

        Ok(DownloadResult {
            status: if failures.is_empty() {
                PhaseStatus::Complete
            } else {
                PhaseStatus::Partial
            },
            summary,
            failures,
            ledger: ledger_path.to_string(),
            failed_list,
        })
    }

    /// Consolidation then download; a fatal error in either phase stops the run.
    pub fn run(
        &self,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, CuratorError> {
        let consolidate = self.consolidate(sink)?;
        if consolidate.status == PhaseStatus::Partial {
            tracing::warn!(
                warnings = consolidate.warnings.len(),
                "consolidation partial, continuing with available sources"
            );
        }
        let download = self.download(options, sink)?;
        Ok(RunResult {
            consolidate,
            download,
        })
    }
}
