use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CuratorError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Geo,
    Sra,
    Ena,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Geo, Source::Sra, Source::Ena];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Geo => "GEO",
            Source::Sra => "SRA",
            Source::Ena => "ENA",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GEO" => Ok(Source::Geo),
            "SRA" => Ok(Source::Sra),
            "ENA" => Ok(Source::Ena),
            _ => Err(CuratorError::UnknownSource(value.to_string())),
        }
    }
}

fn geo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^GSE\d+$").expect("static regex"))
}

fn run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[SED]R[RX]\d+$").expect("static regex"))
}

/// Registry identifier, upper-cased and validated against the registry's pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Accession(String);

impl Accession {
    pub fn parse(source: Source, value: &str) -> Result<Self, CuratorError> {
        let normalized = value.trim().to_ascii_uppercase();
        let pattern = match source {
            Source::Geo => geo_pattern(),
            Source::Sra | Source::Ena => run_pattern(),
        };
        if !pattern.is_match(&normalized) {
            return Err(CuratorError::InvalidAccession {
                source_name: source.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(source, accession)`, the unique key of a sample.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SampleKey {
    pub source: Source,
    pub accession: Accession,
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.accession)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancerType {
    Breast,
    Lung,
    Colorectal,
    Prostate,
    Melanoma,
    Pancreatic,
    Ovarian,
    Unclassified,
}

impl CancerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancerType::Breast => "breast",
            CancerType::Lung => "lung",
            CancerType::Colorectal => "colorectal",
            CancerType::Prostate => "prostate",
            CancerType::Melanoma => "melanoma",
            CancerType::Pancreatic => "pancreatic",
            CancerType::Ovarian => "ovarian",
            CancerType::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for CancerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancerType {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "breast" => Ok(CancerType::Breast),
            "lung" => Ok(CancerType::Lung),
            "colorectal" => Ok(CancerType::Colorectal),
            "prostate" => Ok(CancerType::Prostate),
            "melanoma" => Ok(CancerType::Melanoma),
            "pancreatic" => Ok(CancerType::Pancreatic),
            "ovarian" => Ok(CancerType::Ovarian),
            "unclassified" => Ok(CancerType::Unclassified),
            _ => Err(CuratorError::InvalidCancerType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SequencingLayout {
    #[serde(rename = "paired-end")]
    Paired,
    #[serde(rename = "single-end")]
    Single,
}

impl SequencingLayout {
    /// Directory and report spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencingLayout::Paired => "paired-end",
            SequencingLayout::Single => "single-end",
        }
    }
}

impl fmt::Display for SequencingLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequencingLayout {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paired" | "paired-end" | "pe" => Ok(SequencingLayout::Paired),
            "single" | "single-end" | "se" => Ok(SequencingLayout::Single),
            _ => Err(CuratorError::InvalidLayout(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFlag {
    Pass,
    Warn,
    Fail,
    Unknown,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::Pass => "pass",
            QualityFlag::Warn => "warn",
            QualityFlag::Fail => "fail",
            QualityFlag::Unknown => "unknown",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityFlag {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(QualityFlag::Pass),
            "warn" => Ok(QualityFlag::Warn),
            "fail" => Ok(QualityFlag::Fail),
            "unknown" | "" => Ok(QualityFlag::Unknown),
            _ => Err(CuratorError::InvalidQualityFlag(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReadPart {
    R1,
    R2,
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "supplementary")]
    Supplementary,
}

impl ReadPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPart::R1 => "R1",
            ReadPart::R2 => "R2",
            ReadPart::Single => "single",
            ReadPart::Supplementary => "supplementary",
        }
    }

    /// File name suffix appended to the accession.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            ReadPart::R1 => "_R1.fastq.gz",
            ReadPart::R2 => "_R2.fastq.gz",
            ReadPart::Single => ".fastq.gz",
            ReadPart::Supplementary => "_supplementary.tar",
        }
    }

    /// Position of this part in a registry's advertised file list.
    pub fn file_index(&self) -> usize {
        match self {
            ReadPart::R2 => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ReadPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPart {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "R1" | "r1" => Ok(ReadPart::R1),
            "R2" | "r2" => Ok(ReadPart::R2),
            "single" => Ok(ReadPart::Single),
            "supplementary" => Ok(ReadPart::Supplementary),
            _ => Err(CuratorError::InvalidPart(value.to_string())),
        }
    }
}

/// Canonical sample record shared by every registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    key: SampleKey,
    pub organism: String,
    pub cancer_type: CancerType,
    pub sequencing_layout: SequencingLayout,
    pub read_length: Option<f64>,
    pub base_count: Option<f64>,
    pub read_count: Option<u64>,
    pub title: String,
    pub quality_flag: QualityFlag,
    pub duplicate_group_id: Option<String>,
    /// The registry's own cancer label, kept verbatim.
    pub source_label: Option<String>,
    pub source_files: Vec<String>,
    pub source_checksums: Vec<String>,
}

impl Sample {
    pub fn new(source: Source, accession: Accession) -> Self {
        Self {
            key: SampleKey { source, accession },
            organism: String::new(),
            cancer_type: CancerType::Unclassified,
            sequencing_layout: SequencingLayout::Single,
            read_length: None,
            base_count: None,
            read_count: None,
            title: String::new(),
            quality_flag: QualityFlag::Unknown,
            duplicate_group_id: None,
            source_label: None,
            source_files: Vec::new(),
            source_checksums: Vec::new(),
        }
    }

    pub fn key(&self) -> &SampleKey {
        &self.key
    }

    pub fn source(&self) -> Source {
        self.key.source
    }

    pub fn accession(&self) -> &Accession {
        &self.key.accession
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn accession_is_normalized() {
        let acc = Accession::parse(Source::Sra, " srr1234567 ").unwrap();
        assert_eq!(acc.as_str(), "SRR1234567");
    }

    #[test]
    fn accession_rejects_wrong_registry_shape() {
        let err = Accession::parse(Source::Geo, "SRR123").unwrap_err();
        assert_matches!(err, CuratorError::InvalidAccession { .. });
        assert!(Accession::parse(Source::Ena, "GSE100").is_err());
    }

    #[test]
    fn layout_accepts_registry_spellings() {
        assert_eq!(
            "PAIRED".parse::<SequencingLayout>().unwrap(),
            SequencingLayout::Paired
        );
        assert_eq!(
            "single-end".parse::<SequencingLayout>().unwrap(),
            SequencingLayout::Single
        );
    }

    #[test]
    fn sample_key_orders_by_source_then_accession() {
        let a = SampleKey {
            source: Source::Geo,
            accession: Accession::parse(Source::Geo, "GSE9").unwrap(),
        };
        let b = SampleKey {
            source: Source::Sra,
            accession: Accession::parse(Source::Sra, "SRR1").unwrap(),
        };
        assert!(a < b);
    }
}
