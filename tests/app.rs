use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use rnaseq_curator::app::{App, DownloadOptions, PhaseStatus};
use rnaseq_curator::config::ResolvedConfig;
use rnaseq_curator::consolidate::{MANIFEST_FILE, table_file_name};
use rnaseq_curator::domain::Source;
use rnaseq_curator::jobs::DownloadJob;
use rnaseq_curator::ledger::{DOWNLOAD_REPORT_FILE, FAILED_DOWNLOADS_FILE, read_entries};
use rnaseq_curator::output::JsonOutput;
use rnaseq_curator::ratelimit::{RateLimiter, Sleeper};
use rnaseq_curator::scheduler::Scheduler;
use rnaseq_curator::transfer::{TransferClient, TransferError};

const SRA_TABLE: &str = "\
run_accession,title,organism,library_layout,read_length,base_count,read_count
SRR100,breast cancer tumor RNA-seq,Homo sapiens,PAIRED,100,2000000000,5000000
SRR101,lung adenocarcinoma cohort,Homo sapiens,SINGLE,75,1500000000,50
SRR102,colorectal cancer organoids,Homo sapiens,SINGLE,150,3000000000,2000000
";

/// Fails every attempt for the listed accessions with a 404, succeeds otherwise.
#[derive(Default)]
struct Registry {
    missing: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl Registry {
    fn missing(accessions: &[&str]) -> Self {
        Self {
            missing: Mutex::new(accessions.iter().map(|acc| acc.to_string()).collect()),
            ..Default::default()
        }
    }

    fn restore(&self) {
        self.missing.lock().unwrap().clear();
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl TransferClient for Registry {
    fn fetch(&self, job: &DownloadJob, staging: &Utf8Path) -> Result<(), TransferError> {
        *self.calls.lock().unwrap().entry(job.label()).or_default() += 1;
        let accession = job.sample.accession.to_string();
        if self.missing.lock().unwrap().contains(&accession) {
            return Err(TransferError::Permanent("HTTP 404".to_string()));
        }
        fs::write(staging.as_std_path(), accession.as_bytes()).unwrap();
        Ok(())
    }
}

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

fn config(temp: &tempfile::TempDir) -> ResolvedConfig {
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mut config = ResolvedConfig::default();
    config.paths.data_dir = base.join("data");
    config.paths.report_dir = base.join("results");
    config.paths.download_root = base.join("fastq_downloads");
    config.download.validate_gzip = false;
    config.download.max_workers = 2;
    config
}

fn app(config: ResolvedConfig, registry: Registry) -> App<Registry, NoSleep> {
    let scheduler = Scheduler::new(registry, &config.download)
        .with_sleeper(NoSleep)
        .with_rate_limiter(RateLimiter::unlimited());
    App::with_scheduler(config, scheduler)
}

fn seed_tables(config: &ResolvedConfig) {
    let data_dir = &config.paths.data_dir;
    fs::create_dir_all(data_dir.as_std_path()).unwrap();
    fs::write(
        data_dir.join(table_file_name(Source::Sra)).as_std_path(),
        SRA_TABLE,
    )
    .unwrap();
}

#[test]
fn run_consolidates_then_downloads_passing_samples() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp);
    seed_tables(&config);
    let app = app(config.clone(), Registry::default());

    let result = app.run(&DownloadOptions::default(), &JsonOutput).unwrap();

    assert_eq!(result.consolidate.status, PhaseStatus::Partial);
    assert_eq!(result.consolidate.samples, 3);
    assert!(config.paths.data_dir.join(MANIFEST_FILE).as_std_path().exists());

    // SRR101 fails quality and is skipped; SRR100 is paired.
    let download = &result.download;
    assert_eq!(download.status, PhaseStatus::Complete);
    assert_eq!(download.summary.total_jobs, 3);
    assert_eq!(download.summary.succeeded, 3);
    assert!(download.failed_list.is_none());

    let root = &config.paths.download_root;
    assert!(
        root.join("breast/paired-end/SRR100_R1.fastq.gz")
            .as_std_path()
            .exists()
    );
    assert!(
        root.join("breast/paired-end/SRR100_R2.fastq.gz")
            .as_std_path()
            .exists()
    );
    assert!(
        root.join("colorectal/single-end/SRR102.fastq.gz")
            .as_std_path()
            .exists()
    );

    let again = app.download(&DownloadOptions::default(), &JsonOutput).unwrap();
    assert_eq!(again.summary.total_jobs, 0);
    assert_eq!(app.scheduler().transfers().calls(), 3);
}

#[test]
fn retry_failed_only_revisits_permanent_failures() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp);
    seed_tables(&config);
    let app = app(config.clone(), Registry::missing(&["SRR102"]));
    app.consolidate(&JsonOutput).unwrap();

    let first = app.download(&DownloadOptions::default(), &JsonOutput).unwrap();
    assert_eq!(first.status, PhaseStatus::Partial);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].accession, "SRR102");
    let failed_list = fs::read_to_string(
        config
            .paths
            .report_dir
            .join(FAILED_DOWNLOADS_FILE)
            .as_std_path(),
    )
    .unwrap();
    assert!(failed_list.starts_with("SRR102\tsingle\tSRA\t"));

    app.scheduler().transfers().restore();
    let options = DownloadOptions {
        limit: None,
        retry_failed: true,
    };
    let second = app.download(&options, &JsonOutput).unwrap();
    assert_eq!(second.status, PhaseStatus::Complete);
    assert_eq!(second.summary.total_jobs, 1);
    assert_eq!(second.summary.jobs[0].sample.accession.as_str(), "SRR102");
    assert!(second.failed_list.is_none());
    assert!(
        !config
            .paths
            .report_dir
            .join(FAILED_DOWNLOADS_FILE)
            .as_std_path()
            .exists()
    );

    let ledger = read_entries(
        config
            .paths
            .report_dir
            .join(DOWNLOAD_REPORT_FILE)
            .as_std_path(),
    )
    .unwrap();
    assert_eq!(ledger.len(), 4);
}

#[test]
fn limit_caps_expanded_samples() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp);
    seed_tables(&config);
    let app = app(config, Registry::default());
    app.consolidate(&JsonOutput).unwrap();

    let options = DownloadOptions {
        limit: Some(1),
        retry_failed: false,
    };
    let result = app.download(&options, &JsonOutput).unwrap();
    assert_eq!(result.summary.total_jobs, 2);
    assert!(
        result
            .summary
            .jobs
            .iter()
            .all(|job| job.sample.accession.as_str() == "SRR100")
    );
}
