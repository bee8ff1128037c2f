//! Maps registry-specific rows onto the canonical [`Sample`].
//!
//! Each registry exports a flat table with its own column names. Normalization
//! never aborts a batch: a row that cannot be keyed is reported and skipped, a row
//! with unusable fields is kept and flagged `unknown`.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::QualityConfig;
use crate::domain::{Accession, CancerType, QualityFlag, Sample, SequencingLayout, Source};

pub type RawRecord = HashMap<String, String>;

pub const DEFAULT_ORGANISM: &str = "Homo sapiens";

/// Keyword table for cancer-type assignment, checked in order.
const CANCER_KEYWORDS: &[(CancerType, &[&str])] = &[
    (
        CancerType::Breast,
        &["breast cancer", "brca", "mammary cancer", "breast carcinoma"],
    ),
    (
        CancerType::Lung,
        &["lung cancer", "luad", "lusc", "nsclc", "sclc", "lung adenocarcinoma"],
    ),
    (
        CancerType::Colorectal,
        &[
            "colorectal cancer",
            "crc",
            "colon cancer",
            "rectal cancer",
            "coad",
        ],
    ),
    (CancerType::Prostate, &["prostate cancer", "prad"]),
    (CancerType::Melanoma, &["melanoma", "skin cancer"]),
    (CancerType::Pancreatic, &["pancreatic cancer", "paad", "pdac"]),
    (CancerType::Ovarian, &["ovarian cancer", "ov"]),
];

struct Columns {
    accession: &'static [&'static str],
    title: &'static [&'static str],
    description: &'static [&'static str],
    organism: &'static [&'static str],
    files: &'static [&'static str],
    checksums: &'static [&'static str],
}

const GEO_COLUMNS: Columns = Columns {
    accession: &["gse_id", "accession"],
    title: &["title"],
    description: &["summary"],
    organism: &["organism"],
    files: &["supplementary_file"],
    checksums: &[],
};

const SRA_COLUMNS: Columns = Columns {
    accession: &["run_accession", "experiment_accession", "accession"],
    title: &["title"],
    description: &["study_title"],
    organism: &["organism"],
    files: &["file_names"],
    checksums: &[],
};

const ENA_COLUMNS: Columns = Columns {
    accession: &["run_accession", "accession"],
    title: &["study_title", "description"],
    description: &["description", "sample_title"],
    organism: &["scientific_name", "organism"],
    files: &["fastq_ftp"],
    checksums: &["fastq_md5"],
};

fn columns_for(source: Source) -> &'static Columns {
    match source {
        Source::Geo => &GEO_COLUMNS,
        Source::Sra => &SRA_COLUMNS,
        Source::Ena => &ENA_COLUMNS,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizationIssue {
    pub source: Source,
    /// Zero-based data row within the source table, when known.
    pub row: Option<usize>,
    pub accession: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub samples: Vec<Sample>,
    pub issues: Vec<NormalizationIssue>,
}

pub struct Normalizer {
    quality: QualityConfig,
}

impl Normalizer {
    pub fn new(quality: QualityConfig) -> Self {
        Self { quality }
    }

    pub fn normalize_table(&self, source: Source, records: &[RawRecord]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (row, record) in records.iter().enumerate() {
            if let Some(sample) = self.normalize_record(source, row, record, &mut batch.issues) {
                batch.samples.push(sample);
            }
        }
        tracing::info!(
            source = %source,
            samples = batch.samples.len(),
            issues = batch.issues.len(),
            "normalized source table"
        );
        batch
    }

    /// Returns `None` only when the row has no usable accession.
    pub fn normalize_record(
        &self,
        source: Source,
        row: usize,
        record: &RawRecord,
        issues: &mut Vec<NormalizationIssue>,
    ) -> Option<Sample> {
        let columns = columns_for(source);
        let raw_accession = field(record, columns.accession);
        let mut report = |reason: String| {
            tracing::warn!(source = %source, row, reason = %reason, "normalization issue");
            issues.push(NormalizationIssue {
                source,
                row: Some(row),
                accession: raw_accession.map(str::to_string),
                reason,
            });
        };

        let Some(raw) = raw_accession else {
            report("missing accession".to_string());
            return None;
        };
        let accession = match Accession::parse(source, raw) {
            Ok(accession) => accession,
            Err(err) => {
                report(err.to_string());
                return None;
            }
        };

        let mut sample = Sample::new(source, accession);
        let mut rejected = false;

        sample.title = field(record, columns.title)
            .or_else(|| field(record, columns.description))
            .unwrap_or_default()
            .to_string();
        sample.organism = field(record, columns.organism)
            .unwrap_or(DEFAULT_ORGANISM)
            .to_string();
        sample.source_files = split_list(field(record, columns.files));
        sample.source_checksums = split_list(field(record, columns.checksums));
        sample.source_label = field(record, &["cancer_type"]).map(str::to_string);

        let description = field(record, columns.description).unwrap_or_default();
        sample.cancer_type = classify_cancer_type(
            sample.source_label.as_deref(),
            &format!("{} {}", sample.title, description),
        );

        let explicit_layout = field(record, &["library_layout", "sequencing_type"]);
        let parsed_layout = match explicit_layout.map(str::parse::<SequencingLayout>) {
            Some(Ok(layout)) => Some(layout),
            Some(Err(err)) => {
                report(err.to_string());
                None
            }
            None => None,
        };
        sample.sequencing_layout =
            parsed_layout.unwrap_or_else(|| infer_layout_from_files(&sample.source_files));

        sample.read_length = match parse_number(record, &["read_length", "avg_read_length"]) {
            Ok(value) => value,
            Err(reason) => {
                report(reason);
                rejected = true;
                None
            }
        };
        sample.base_count = match parse_number(record, &["base_count"]) {
            Ok(value) => value,
            Err(reason) => {
                report(reason);
                rejected = true;
                None
            }
        };
        sample.read_count = match parse_number(record, &["read_count", "spots"]) {
            Ok(value) => value.map(|count| count as u64),
            Err(reason) => {
                report(reason);
                rejected = true;
                None
            }
        };

        sample.quality_flag = self.quality_flag(&sample, rejected);
        Some(sample)
    }

    fn quality_flag(&self, sample: &Sample, rejected: bool) -> QualityFlag {
        if rejected || (sample.read_length.is_none() && sample.base_count.is_none()) {
            return QualityFlag::Unknown;
        }
        if let Some(reads) = sample.read_count {
            if reads < self.quality.min_reads_per_sample {
                return QualityFlag::Fail;
            }
        }
        let short_reads = sample
            .read_length
            .is_some_and(|length| length < self.quality.min_read_length);
        let shallow = sample
            .base_count
            .is_some_and(|bases| bases < self.quality.min_base_count);
        if short_reads || shallow {
            QualityFlag::Warn
        } else {
            QualityFlag::Pass
        }
    }
}

/// Lower-cased words with punctuation stripped.
pub fn normalized_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// Explicit registry label first, then keywords in the label, then in free text.
pub fn classify_cancer_type(label: Option<&str>, text: &str) -> CancerType {
    if let Some(label) = label {
        if let Ok(parsed) = label.parse::<CancerType>() {
            if parsed != CancerType::Unclassified {
                return parsed;
            }
        }
        if let Some(found) = match_keywords(label) {
            return found;
        }
    }
    match_keywords(text).unwrap_or(CancerType::Unclassified)
}

fn match_keywords(text: &str) -> Option<CancerType> {
    let haystack = format!(" {} ", normalized_words(text).join(" "));
    CANCER_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords
                .iter()
                .any(|keyword| haystack.contains(&format!(" {keyword} ")))
        })
        .map(|(cancer_type, _)| *cancer_type)
}

pub fn infer_layout_from_files(files: &[String]) -> SequencingLayout {
    if files.len() >= 2 {
        return SequencingLayout::Paired;
    }
    let paired_hint = files.iter().any(|file| {
        let name = file.rsplit('/').next().unwrap_or(file).to_ascii_lowercase();
        ["_2.fastq", "_r2.fastq", "_r2_", "_2.fq", "_r2.fq"]
            .iter()
            .any(|hint| name.contains(hint))
    });
    if paired_hint {
        SequencingLayout::Paired
    } else {
        SequencingLayout::Single
    }
}

fn field<'a>(record: &'a RawRecord, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| record.get(*name))
        .map(|value| value.trim())
        .find(|value| !value.is_empty() && !value.eq_ignore_ascii_case("nan"))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(';')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Registries export `0` for "not reported"; that is treated as absent.
fn parse_number(record: &RawRecord, names: &[&str]) -> Result<Option<f64>, String> {
    let Some(raw) = field(record, names) else {
        return Ok(None);
    };
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("{}: not a number: {raw}", names[0]))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{}: out of range: {raw}", names[0]));
    }
    Ok((value > 0.0).then_some(value))
}
