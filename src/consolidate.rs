use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::app::PhaseStatus;
use crate::config::ResolvedConfig;
use crate::domain::{CancerType, Sample, Source};
use crate::duplicates::{DuplicateDetector, DuplicateReport, render_report};
use crate::error::CuratorError;
use crate::manifest::write_manifest;
use crate::normalize::{NormalizationIssue, Normalizer, RawRecord};

pub const MANIFEST_FILE: &str = "consolidated_metadata.csv";
pub const DUPLICATE_REPORT_FILE: &str = "duplicate_report.txt";
pub const SUMMARY_FILE: &str = "consolidation_summary.txt";

pub fn table_file_name(source: Source) -> &'static str {
    match source {
        Source::Geo => "geo_datasets.csv",
        Source::Sra => "sra_experiments.csv",
        Source::Ena => "ena_runs.csv",
    }
}

/// A registry's raw table; `records` is `None` when the table was not produced.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub source: Source,
    pub records: Option<Vec<RawRecord>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageWarning {
    pub source: Source,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationSummary {
    pub total_samples: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_cancer_type: BTreeMap<String, usize>,
    pub by_layout: BTreeMap<String, usize>,
    pub by_quality: BTreeMap<String, usize>,
    pub duplicate_groups: usize,
    pub samples_in_duplicate_groups: usize,
    pub label_conflicts: usize,
    pub unclassified: usize,
    pub normalization_issues: usize,
}

#[derive(Debug)]
pub struct Consolidation {
    pub status: PhaseStatus,
    pub manifest: Vec<Sample>,
    pub duplicates: DuplicateReport,
    pub summary: ConsolidationSummary,
    pub issues: Vec<NormalizationIssue>,
    pub warnings: Vec<CoverageWarning>,
}

pub struct Consolidator {
    normalizer: Normalizer,
    detector: DuplicateDetector,
}

impl Consolidator {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            normalizer: Normalizer::new(config.quality.clone()),
            detector: DuplicateDetector::new(config.duplicates.clone()),
        }
    }

    /// Reads every registry table present in `data_dir`.
    pub fn load_tables(data_dir: &Utf8Path) -> Result<Vec<SourceTable>, CuratorError> {
        Source::ALL
            .iter()
            .map(|source| {
                let path = data_dir.join(table_file_name(*source));
                Ok(SourceTable {
                    source: *source,
                    records: read_table(path.as_std_path())?,
                })
            })
            .collect()
    }

    pub fn consolidate(&self, tables: Vec<SourceTable>) -> Result<Consolidation, CuratorError> {
        let mut warnings = Vec::new();
        let mut issues = Vec::new();
        let mut manifest = Vec::new();
        let mut seen = HashSet::new();

        for table in tables {
            let records = match table.records {
                None => {
                    warnings.push(CoverageWarning {
                        source: table.source,
                        message: "source table missing".to_string(),
                    });
                    continue;
                }
                Some(records) if records.is_empty() => {
                    warnings.push(CoverageWarning {
                        source: table.source,
                        message: "source table empty".to_string(),
                    });
                    continue;
                }
                Some(records) => records,
            };

            let batch = self.normalizer.normalize_table(table.source, &records);
            issues.extend(batch.issues);
            for sample in batch.samples {
                if !seen.insert(sample.key().clone()) {
                    issues.push(NormalizationIssue {
                        source: sample.source(),
                        row: None,
                        accession: Some(sample.accession().to_string()),
                        reason: "duplicate (source, accession) row dropped".to_string(),
                    });
                    continue;
                }
                manifest.push(sample);
            }
        }

        for warning in &warnings {
            tracing::warn!(source = %warning.source, "{}", warning.message);
        }
        if manifest.is_empty() {
            return Err(CuratorError::EmptyManifest);
        }

        manifest.sort_by(|a, b| a.key().cmp(b.key()));
        let duplicates = self.detector.detect(&manifest);
        for sample in &mut manifest {
            sample.duplicate_group_id = duplicates.group_of(sample.key()).map(str::to_string);
        }

        let summary = summarize(&manifest, &duplicates, issues.len());
        let status = if warnings.is_empty() {
            PhaseStatus::Complete
        } else {
            PhaseStatus::Partial
        };
        tracing::info!(
            samples = summary.total_samples,
            duplicate_groups = summary.duplicate_groups,
            ?status,
            "consolidation finished"
        );

        Ok(Consolidation {
            status,
            manifest,
            duplicates,
            summary,
            issues,
            warnings,
        })
    }

    /// Writes the manifest, duplicate report and summary into `data_dir`.
    pub fn write_outputs(
        data_dir: &Utf8Path,
        consolidation: &Consolidation,
    ) -> Result<Vec<Utf8PathBuf>, CuratorError> {
        fs::create_dir_all(data_dir.as_std_path()).map_err(|err| CuratorError::ReportWrite {
            path: data_dir.as_std_path().to_path_buf(),
            message: err.to_string(),
        })?;

        let manifest_path = data_dir.join(MANIFEST_FILE);
        write_manifest(manifest_path.as_std_path(), &consolidation.manifest)?;

        let report_path = data_dir.join(DUPLICATE_REPORT_FILE);
        write_text(&report_path, &render_report(&consolidation.duplicates))?;

        let summary_path = data_dir.join(SUMMARY_FILE);
        write_text(&summary_path, &render_summary(consolidation))?;

        Ok(vec![manifest_path, report_path, summary_path])
    }
}

/// `Ok(None)` when the file does not exist.
pub fn read_table(path: &Path) -> Result<Option<Vec<RawRecord>>, CuratorError> {
    if !path.exists() {
        return Ok(None);
    }
    let read_err = |message: String| CuratorError::TableRead {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| read_err(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| read_err(err.to_string()))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| read_err(err.to_string()))?;
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(name, value)| (name.trim().to_string(), value.to_string()))
            .collect();
        records.push(record);
    }
    tracing::info!(path = %path.display(), rows = records.len(), "loaded source table");
    Ok(Some(records))
}

fn summarize(
    manifest: &[Sample],
    duplicates: &DuplicateReport,
    issue_count: usize,
) -> ConsolidationSummary {
    let mut summary = ConsolidationSummary {
        total_samples: manifest.len(),
        duplicate_groups: duplicates.groups.len(),
        samples_in_duplicate_groups: duplicates.assignments.len(),
        label_conflicts: duplicates.conflicts.len(),
        normalization_issues: issue_count,
        ..Default::default()
    };
    for sample in manifest {
        *summary
            .by_source
            .entry(sample.source().to_string())
            .or_default() += 1;
        *summary
            .by_cancer_type
            .entry(sample.cancer_type.to_string())
            .or_default() += 1;
        *summary
            .by_layout
            .entry(sample.sequencing_layout.to_string())
            .or_default() += 1;
        *summary
            .by_quality
            .entry(sample.quality_flag.to_string())
            .or_default() += 1;
        if sample.cancer_type == CancerType::Unclassified {
            summary.unclassified += 1;
        }
    }
    summary
}

pub fn render_summary(consolidation: &Consolidation) -> String {
    let summary = &consolidation.summary;
    let mut out = String::new();
    let _ = writeln!(out, "Metadata Consolidation Summary Report");
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out);
    let _ = writeln!(out, "Total Samples: {}", summary.total_samples);

    for (heading, counts) in [
        ("Samples by Database", &summary.by_source),
        ("Samples by Cancer Type", &summary.by_cancer_type),
        ("Samples by Sequencing Type", &summary.by_layout),
        ("Quality Summary", &summary.by_quality),
    ] {
        let _ = writeln!(out);
        let _ = writeln!(out, "{heading}:");
        for (name, count) in counts {
            let _ = writeln!(out, "  {name}: {count}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Unclassified Samples: {}", summary.unclassified);
    let _ = writeln!(out, "Duplicate Groups Detected: {}", summary.duplicate_groups);
    let _ = writeln!(
        out,
        "Samples in Duplicate Groups: {}",
        summary.samples_in_duplicate_groups
    );
    let _ = writeln!(out, "Cancer-Type Conflicts: {}", summary.label_conflicts);
    let _ = writeln!(out, "Normalization Issues: {}", summary.normalization_issues);

    if !consolidation.warnings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Warnings:");
        for warning in &consolidation.warnings {
            let _ = writeln!(out, "  {}: {}", warning.source, warning.message);
        }
    }
    for issue in &consolidation.issues {
        let row = issue
            .row
            .map(|row| row.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  issue {} row {} ({}): {}",
            issue.source,
            row,
            issue.accession.as_deref().unwrap_or("-"),
            issue.reason
        );
    }
    out
}

fn write_text(path: &Utf8Path, content: &str) -> Result<(), CuratorError> {
    fs::write(path.as_std_path(), content).map_err(|err| CuratorError::ReportWrite {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    })
}
