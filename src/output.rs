use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ConsolidateResult, DownloadResult, ProgressEvent, ProgressSink, RunResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_consolidate(result: &ConsolidateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable summaries on stdout, progress lines on stderr.
pub struct TextOutput;

impl TextOutput {
    pub fn print_consolidate(result: &ConsolidateResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "consolidation: {:?}", result.status)?;
        writeln!(out, "  samples: {}", result.samples)?;
        writeln!(
            out,
            "  duplicate groups: {} ({} samples)",
            result.duplicate_groups, result.samples_in_duplicate_groups
        )?;
        writeln!(out, "  cancer-type conflicts: {}", result.label_conflicts)?;
        writeln!(out, "  normalization issues: {}", result.normalization_issues)?;
        for warning in &result.warnings {
            writeln!(out, "  warning: {warning}")?;
        }
        for path in &result.outputs {
            writeln!(out, "  wrote {path}")?;
        }
        Ok(())
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        let summary = &result.summary;
        writeln!(out, "download: {:?}", result.status)?;
        writeln!(
            out,
            "  jobs: {} succeeded, {} failed of {}",
            summary.succeeded, summary.failed, summary.total_jobs
        )?;
        writeln!(out, "  peak concurrency: {}", summary.peak_in_progress)?;
        writeln!(out, "  ledger: {}", result.ledger)?;
        for failure in &result.failures {
            writeln!(
                out,
                "  failed {} {}: {}",
                failure.accession, failure.part, failure.error
            )?;
        }
        if let Some(path) = &result.failed_list {
            writeln!(out, "  failed list: {path}")?;
        }
        Ok(())
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_consolidate(&result.consolidate)?;
        Self::print_download(&result.download)
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
