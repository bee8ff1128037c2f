use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::domain::{ReadPart, Source};
use crate::error::CuratorError;
use crate::jobs::{DownloadJob, PartKey};
use crate::retry::JobState;
use crate::verify::ChecksumOutcome;

pub const DOWNLOAD_REPORT_FILE: &str = "download_report.csv";
pub const FAILED_DOWNLOADS_FILE: &str = "failed_downloads.txt";

/// One row of `download_report.csv`, written when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadReportEntry {
    pub accession: String,
    pub database: Source,
    pub part: ReadPart,
    pub state: JobState,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub checksum: ChecksumOutcome,
    pub expected_checksum: Option<String>,
    pub observed_checksum: Option<String>,
    pub destination: String,
    pub error: Option<String>,
    pub finished_at: String,
}

impl DownloadReportEntry {
    pub fn from_job(job: &DownloadJob, checksum: ChecksumOutcome, elapsed_ms: u64) -> Self {
        Self {
            accession: job.sample.accession.to_string(),
            database: job.sample.source,
            part: job.part,
            state: job.state,
            attempts: job.attempt_count,
            elapsed_ms,
            checksum,
            expected_checksum: job.expected_checksum.clone(),
            observed_checksum: job.observed_checksum.clone(),
            destination: job.destination.to_string(),
            error: job.last_error.clone(),
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Append-only CSV writer shared by all workers.
pub struct Ledger {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl Ledger {
    /// Opens `path` for appending; the header is written only for a new file.
    pub fn open(path: &Path) -> Result<Self, CuratorError> {
        let write_err = |err: &dyn std::fmt::Display| CuratorError::ReportWrite {
            path: path.to_path_buf(),
            message: err.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| write_err(&err))?;
        }
        let has_rows = path.metadata().map(|meta| meta.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| write_err(&err))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!has_rows)
            .from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &DownloadReportEntry) -> Result<(), CuratorError> {
        let write_err = |message: String| CuratorError::ReportWrite {
            path: self.path.clone(),
            message,
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .serialize(entry)
            .map_err(|err| write_err(err.to_string()))?;
        writer.flush().map_err(|err| write_err(err.to_string()))
    }
}

/// Empty when the ledger does not exist yet.
pub fn read_entries(path: &Path) -> Result<Vec<DownloadReportEntry>, CuratorError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let read_err = |message: String| CuratorError::TableRead {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|err| read_err(err.to_string()))?;
    reader
        .deserialize()
        .map(|row| row.map_err(|err| read_err(err.to_string())))
        .collect()
}

/// Parts whose most recent entry is a permanent failure.
pub fn failed_parts(entries: &[DownloadReportEntry]) -> HashSet<PartKey> {
    latest_failures(entries)
        .into_iter()
        .map(|entry| (entry.database, entry.accession.clone(), entry.part))
        .collect()
}

/// Most recent entry per part, kept only when it is a permanent failure; ledger order.
fn latest_failures(entries: &[DownloadReportEntry]) -> Vec<&DownloadReportEntry> {
    let mut latest: HashMap<PartKey, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        latest.insert((entry.database, entry.accession.clone(), entry.part), index);
    }
    let mut indices: Vec<usize> = latest
        .into_values()
        .filter(|&index| entries[index].state == JobState::FailedPermanent)
        .collect();
    indices.sort_unstable();
    indices.into_iter().map(|index| &entries[index]).collect()
}

/// Rewrites the tab-separated `accession, part, database, error` list from the ledger's
/// latest state. The file is removed when nothing is failing; returns whether it exists.
pub fn write_failed_downloads(
    path: &Path,
    entries: &[DownloadReportEntry],
) -> Result<bool, CuratorError> {
    let write_err = |err: std::io::Error| CuratorError::ReportWrite {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let failures = latest_failures(entries);
    if failures.is_empty() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(false),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(write_err(err)),
        };
    }

    let mut out = String::new();
    for entry in failures {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}",
            entry.accession,
            entry.part,
            entry.database,
            entry.error.as_deref().unwrap_or("unknown error")
        );
    }
    fs::write(path, out).map_err(write_err)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(accession: &str, state: JobState) -> DownloadReportEntry {
        DownloadReportEntry {
            accession: accession.to_string(),
            database: Source::Sra,
            part: ReadPart::Single,
            state,
            attempts: 1,
            elapsed_ms: 5,
            checksum: ChecksumOutcome::Skipped,
            expected_checksum: None,
            observed_checksum: None,
            destination: format!("dl/{accession}.fastq.gz"),
            error: (state == JobState::FailedPermanent).then(|| "404".to_string()),
            finished_at: "2024-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn reopening_appends_without_second_header() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(DOWNLOAD_REPORT_FILE);

        Ledger::open(&path)
            .unwrap()
            .append(&entry("SRR1", JobState::Succeeded))
            .unwrap();
        Ledger::open(&path)
            .unwrap()
            .append(&entry("SRR2", JobState::FailedPermanent))
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("accession,database").count(), 1);
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].error.as_deref(), Some("404"));
    }

    #[test]
    fn latest_entry_decides_failed_parts() {
        let entries = vec![
            entry("SRR1", JobState::FailedPermanent),
            entry("SRR1", JobState::Succeeded),
            entry("SRR2", JobState::FailedPermanent),
        ];
        let failed = failed_parts(&entries);
        assert_eq!(failed.len(), 1);
        assert!(failed.contains(&(Source::Sra, "SRR2".to_string(), ReadPart::Single)));
    }

    #[test]
    fn failed_parts_are_keyed_by_registry() {
        let mut mirrored = entry("SRR1", JobState::Succeeded);
        mirrored.database = Source::Ena;
        let entries = vec![entry("SRR1", JobState::FailedPermanent), mirrored];
        let failed = failed_parts(&entries);
        assert_eq!(failed.len(), 1);
        assert!(failed.contains(&(Source::Sra, "SRR1".to_string(), ReadPart::Single)));
    }

    #[test]
    fn failed_list_follows_latest_ledger_state() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(FAILED_DOWNLOADS_FILE);

        let mut entries = vec![
            entry("SRR1", JobState::FailedPermanent),
            entry("SRR2", JobState::FailedPermanent),
        ];
        assert!(write_failed_downloads(&path, &entries).unwrap());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "SRR1\tsingle\tSRA\t404\nSRR2\tsingle\tSRA\t404\n"
        );

        entries.push(entry("SRR1", JobState::Succeeded));
        assert!(write_failed_downloads(&path, &entries).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "SRR2\tsingle\tSRA\t404\n");

        entries.push(entry("SRR2", JobState::Succeeded));
        assert!(!write_failed_downloads(&path, &entries).unwrap());
        assert!(!path.exists());
    }
}
