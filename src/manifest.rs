use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{Accession, CancerType, QualityFlag, Sample, SequencingLayout, Source};
use crate::error::CuratorError;

/// One row of `consolidated_metadata.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub accession: String,
    pub database: Source,
    pub cancer_type: CancerType,
    pub sequencing_type: SequencingLayout,
    pub read_length: Option<f64>,
    pub base_count: Option<f64>,
    pub quality_flag: QualityFlag,
    pub duplicate_group_id: Option<String>,
    pub organism: String,
    pub title: String,
    #[serde(default)]
    pub source_files: String,
    #[serde(default)]
    pub source_checksums: String,
}

impl From<&Sample> for ManifestRow {
    fn from(sample: &Sample) -> Self {
        Self {
            accession: sample.accession().to_string(),
            database: sample.source(),
            cancer_type: sample.cancer_type,
            sequencing_type: sample.sequencing_layout,
            read_length: sample.read_length,
            base_count: sample.base_count,
            quality_flag: sample.quality_flag,
            duplicate_group_id: sample.duplicate_group_id.clone(),
            organism: sample.organism.clone(),
            title: sample.title.clone(),
            source_files: sample.source_files.join(";"),
            source_checksums: sample.source_checksums.join(";"),
        }
    }
}

impl TryFrom<ManifestRow> for Sample {
    type Error = CuratorError;

    fn try_from(row: ManifestRow) -> Result<Self, Self::Error> {
        let accession = Accession::parse(row.database, &row.accession)?;
        let mut sample = Sample::new(row.database, accession);
        sample.cancer_type = row.cancer_type;
        sample.sequencing_layout = row.sequencing_type;
        sample.read_length = row.read_length;
        sample.base_count = row.base_count;
        sample.quality_flag = row.quality_flag;
        sample.duplicate_group_id = row.duplicate_group_id.filter(|id| !id.is_empty());
        sample.organism = row.organism;
        sample.title = row.title;
        sample.source_files = split(&row.source_files);
        sample.source_checksums = split(&row.source_checksums);
        Ok(sample)
    }
}

fn split(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn write_manifest(path: &Path, samples: &[Sample]) -> Result<(), CuratorError> {
    let write_err = |message: String| CuratorError::ReportWrite {
        path: path.to_path_buf(),
        message,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| write_err(err.to_string()))?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|err| write_err(err.to_string()))?;
    for sample in samples {
        writer
            .serialize(ManifestRow::from(sample))
            .map_err(|err| write_err(err.to_string()))?;
    }
    writer.flush().map_err(|err| write_err(err.to_string()))?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<Vec<Sample>, CuratorError> {
    let read_err = |message: String| CuratorError::TableRead {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|err| read_err(err.to_string()))?;
    let mut samples = Vec::new();
    for row in reader.deserialize::<ManifestRow>() {
        let row = row.map_err(|err| read_err(err.to_string()))?;
        samples.push(Sample::try_from(row)?);
    }
    tracing::info!(path = %path.display(), samples = samples.len(), "loaded manifest");
    Ok(samples)
}
