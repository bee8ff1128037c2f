//! Expands manifest samples into transfer jobs.
//!
//! Building is pure: existence of destination files is answered by an
//! [`ArtifactIndex`] supplied by the caller, so the same manifest and index always
//! produce the same jobs.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{QualityFlag, ReadPart, Sample, SampleKey, SequencingLayout, Source};
use crate::retry::JobState;

pub const ENA_FASTQ_BASE: &str = "https://ftp.sra.ebi.ac.uk/vol1/fastq";
pub const GEO_DOWNLOAD_BASE: &str = "https://www.ncbi.nlm.nih.gov/geo/download/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Registry sequence-dump tooling (SRA).
    SequenceDump,
    /// Direct file URL (ENA).
    DirectFile,
    /// Series supplementary archive (GEO).
    Supplementary,
}

impl Protocol {
    pub fn for_source(source: Source) -> Self {
        match source {
            Source::Sra => Protocol::SequenceDump,
            Source::Ena => Protocol::DirectFile,
            Source::Geo => Protocol::Supplementary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadJob {
    pub sample: SampleKey,
    pub part: ReadPart,
    pub protocol: Protocol,
    pub source_uri: String,
    pub destination: Utf8PathBuf,
    pub attempt_count: u32,
    pub state: JobState,
    pub expected_checksum: Option<String>,
    pub observed_checksum: Option<String>,
    pub last_error: Option<String>,
}

impl DownloadJob {
    pub fn new(
        sample: SampleKey,
        part: ReadPart,
        protocol: Protocol,
        source_uri: String,
        destination: Utf8PathBuf,
        expected_checksum: Option<String>,
    ) -> Self {
        Self {
            sample,
            part,
            protocol,
            source_uri,
            destination,
            attempt_count: 0,
            state: JobState::Pending,
            expected_checksum,
            observed_checksum: None,
            last_error: None,
        }
    }

    /// `ACCESSION/part`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}/{}", self.sample.accession, self.part)
    }
}

pub trait ArtifactIndex {
    fn contains(&self, path: &Utf8Path) -> bool;
}

/// Answers from the filesystem.
pub struct FsArtifacts;

impl ArtifactIndex for FsArtifacts {
    fn contains(&self, path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }
}

impl ArtifactIndex for HashSet<Utf8PathBuf> {
    fn contains(&self, path: &Utf8Path) -> bool {
        HashSet::contains(self, path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Maximum number of samples to expand.
    pub limit: Option<usize>,
    /// Restrict to these parts, e.g. failures of a prior run.
    pub only: Option<HashSet<PartKey>>,
}

/// `(source, accession, part)`; ENA mirrors SRA runs under the same accession.
pub type PartKey = (Source, String, ReadPart);

pub fn parts_for(sample: &Sample) -> &'static [ReadPart] {
    match (sample.source(), sample.sequencing_layout) {
        (Source::Geo, _) => &[ReadPart::Supplementary],
        (_, SequencingLayout::Paired) => &[ReadPart::R1, ReadPart::R2],
        (_, SequencingLayout::Single) => &[ReadPart::Single],
    }
}

/// `<root>/<cancer_type>/<layout>/<accession><suffix>`
pub fn destination_path(root: &Utf8Path, sample: &Sample, part: ReadPart) -> Utf8PathBuf {
    root.join(sample.cancer_type.as_str())
        .join(sample.sequencing_layout.as_str())
        .join(format!("{}{}", sample.accession(), part.file_suffix()))
}

pub fn build_jobs(
    manifest: &[Sample],
    root: &Utf8Path,
    existing: &dyn ArtifactIndex,
    options: &BuildOptions,
) -> Vec<DownloadJob> {
    let mut jobs: Vec<DownloadJob> = Vec::new();
    let mut planned: HashSet<Utf8PathBuf> = HashSet::new();
    let mut expanded = 0usize;

    for sample in manifest {
        if options.limit.is_some_and(|limit| expanded >= limit) {
            break;
        }
        if sample.quality_flag == QualityFlag::Fail {
            continue;
        }

        let mut produced = false;
        for &part in parts_for(sample) {
            if let Some(only) = &options.only {
                if !only.contains(&(sample.source(), sample.accession().to_string(), part)) {
                    continue;
                }
            }
            let destination = destination_path(root, sample, part);
            if existing.contains(&destination) {
                continue;
            }
            if !planned.insert(destination.clone()) {
                tracing::warn!(
                    sample = %sample.key(),
                    part = %part,
                    %destination,
                    "destination already planned by another registry, skipping"
                );
                continue;
            }
            let (source_uri, expected_checksum) = source_for(sample, part);
            jobs.push(DownloadJob::new(
                sample.key().clone(),
                part,
                Protocol::for_source(sample.source()),
                source_uri,
                destination,
                expected_checksum,
            ));
            produced = true;
        }
        if produced {
            expanded += 1;
        }
    }
    jobs
}

fn source_for(sample: &Sample, part: ReadPart) -> (String, Option<String>) {
    let accession = sample.accession().as_str();
    match sample.source() {
        Source::Sra => (format!("sra://{accession}"), None),
        Source::Geo => {
            let uri = sample
                .source_files
                .first()
                .map(|url| with_scheme(url))
                .unwrap_or_else(|| format!("{GEO_DOWNLOAD_BASE}?acc={accession}&format=file"));
            (uri, None)
        }
        Source::Ena => match advertised_file(&sample.source_files, part) {
            Some(index) => (
                with_scheme(&sample.source_files[index]),
                sample.source_checksums.get(index).cloned(),
            ),
            None => (ena_fastq_url(accession, part), None),
        },
    }
}

/// Index of the advertised file carrying `part`. Archives sometimes list an
/// unpaired `<acc>.fastq.gz` ahead of the `_1`/`_2` mates.
fn advertised_file(files: &[String], part: ReadPart) -> Option<usize> {
    let suffix = match part {
        ReadPart::R1 => Some("_1.fastq.gz"),
        ReadPart::R2 => Some("_2.fastq.gz"),
        _ => None,
    };
    if let Some(suffix) = suffix {
        if let Some(index) = files.iter().position(|file| file.ends_with(suffix)) {
            return Some(index);
        }
    }
    let index = part.file_index();
    (index < files.len()).then_some(index)
}

fn with_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Canonical archive location: `<prefix6>/[<subdir>/]<acc>/<acc>[_1|_2].fastq.gz`.
pub fn ena_fastq_url(accession: &str, part: ReadPart) -> String {
    let prefix = &accession[..accession.len().min(6)];
    let digits = accession.len().saturating_sub(3);
    let subdir = match digits {
        0..=6 => String::new(),
        7 => format!("00{}/", &accession[accession.len() - 1..]),
        8 => format!("0{}/", &accession[accession.len() - 2..]),
        _ => format!("{}/", &accession[accession.len() - 3..]),
    };
    let file = match part {
        ReadPart::R1 => format!("{accession}_1.fastq.gz"),
        ReadPart::R2 => format!("{accession}_2.fastq.gz"),
        _ => format!("{accession}.fastq.gz"),
    };
    format!("{ENA_FASTQ_BASE}/{prefix}/{subdir}{accession}/{file}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Accession, CancerType};

    fn sample(source: Source, accession: &str, layout: SequencingLayout) -> Sample {
        let mut sample = Sample::new(source, Accession::parse(source, accession).unwrap());
        sample.cancer_type = CancerType::Breast;
        sample.sequencing_layout = layout;
        sample.quality_flag = QualityFlag::Pass;
        sample
    }

    #[test]
    fn paired_sample_yields_two_jobs_in_one_directory() {
        let root = Utf8PathBuf::from("fastq_downloads");
        let manifest = vec![sample(Source::Sra, "SRR100", SequencingLayout::Paired)];
        let jobs = build_jobs(
            &manifest,
            &root,
            &HashSet::<Utf8PathBuf>::new(),
            &BuildOptions::default(),
        );
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            jobs[0].destination,
            Utf8PathBuf::from("fastq_downloads/breast/paired-end/SRR100_R1.fastq.gz")
        );
        assert_eq!(
            jobs[1].destination,
            Utf8PathBuf::from("fastq_downloads/breast/paired-end/SRR100_R2.fastq.gz")
        );
        assert_eq!(jobs[0].destination.parent(), jobs[1].destination.parent());
        assert_eq!(jobs[0].source_uri, "sra://SRR100");
    }

    #[test]
    fn failed_quality_and_present_files_are_skipped() {
        let root = Utf8PathBuf::from("dl");
        let mut failed = sample(Source::Sra, "SRR1", SequencingLayout::Single);
        failed.quality_flag = QualityFlag::Fail;
        let present = sample(Source::Sra, "SRR2", SequencingLayout::Single);
        let existing: HashSet<Utf8PathBuf> =
            [destination_path(&root, &present, ReadPart::Single)].into();

        let jobs = build_jobs(
            &[failed, present],
            &root,
            &existing,
            &BuildOptions::default(),
        );
        assert!(jobs.is_empty());
    }

    #[test]
    fn ena_jobs_use_advertised_files_and_checksums() {
        let mut ena = sample(Source::Ena, "ERR1234567", SequencingLayout::Paired);
        ena.source_files = vec![
            "ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/007/ERR1234567/ERR1234567.fastq.gz".to_string(),
            "ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/007/ERR1234567/ERR1234567_1.fastq.gz".to_string(),
            "ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/007/ERR1234567/ERR1234567_2.fastq.gz".to_string(),
        ];
        ena.source_checksums = vec!["00".to_string(), "11".to_string(), "22".to_string()];
        let jobs = build_jobs(
            &[ena],
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &BuildOptions::default(),
        );
        assert_eq!(jobs[0].expected_checksum.as_deref(), Some("11"));
        assert_eq!(jobs[1].expected_checksum.as_deref(), Some("22"));
        assert!(jobs[1].source_uri.starts_with("https://ftp.sra.ebi.ac.uk/"));
    }

    #[test]
    fn ena_canonical_url_layout() {
        assert_eq!(
            ena_fastq_url("ERR123456", ReadPart::Single),
            "https://ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/ERR123456/ERR123456.fastq.gz"
        );
        assert_eq!(
            ena_fastq_url("SRR1234567", ReadPart::R2),
            "https://ftp.sra.ebi.ac.uk/vol1/fastq/SRR123/007/SRR1234567/SRR1234567_2.fastq.gz"
        );
    }

    #[test]
    fn geo_series_is_one_supplementary_job() {
        let geo = sample(Source::Geo, "GSE5000", SequencingLayout::Paired);
        let jobs = build_jobs(
            &[geo],
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &BuildOptions::default(),
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].part, ReadPart::Supplementary);
        assert_eq!(jobs[0].protocol, Protocol::Supplementary);
        assert!(jobs[0].source_uri.contains("acc=GSE5000"));
    }

    #[test]
    fn limit_counts_samples_not_jobs() {
        let manifest = vec![
            sample(Source::Sra, "SRR1", SequencingLayout::Paired),
            sample(Source::Sra, "SRR2", SequencingLayout::Paired),
        ];
        let options = BuildOptions {
            limit: Some(1),
            only: None,
        };
        let jobs = build_jobs(
            &manifest,
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &options,
        );
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.sample.accession.as_str() == "SRR1"));
    }

    #[test]
    fn mirrored_run_is_planned_once() {
        let manifest = vec![
            sample(Source::Sra, "SRR1", SequencingLayout::Single),
            sample(Source::Ena, "SRR1", SequencingLayout::Single),
            sample(Source::Ena, "SRR2", SequencingLayout::Single),
        ];
        let jobs = build_jobs(
            &manifest,
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &BuildOptions::default(),
        );
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].sample.source, Source::Sra);
        assert_eq!(jobs[0].destination, Utf8PathBuf::from("dl/breast/single-end/SRR1.fastq.gz"));
        assert_eq!(jobs[1].sample.accession.as_str(), "SRR2");
        let destinations: HashSet<_> = jobs.iter().map(|job| &job.destination).collect();
        assert_eq!(destinations.len(), jobs.len());
    }

    #[test]
    fn retry_filter_distinguishes_registries() {
        let manifest = vec![
            sample(Source::Ena, "ERR7", SequencingLayout::Single),
            sample(Source::Sra, "SRR7", SequencingLayout::Single),
        ];
        let options = BuildOptions {
            limit: None,
            only: Some([(Source::Ena, "SRR7".to_string(), ReadPart::Single)].into()),
        };
        let jobs = build_jobs(
            &manifest,
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &options,
        );
        assert!(jobs.is_empty());
    }

    #[test]
    fn job_serializes_destination_as_plain_path() {
        let jobs = build_jobs(
            &[sample(Source::Sra, "SRR1", SequencingLayout::Single)],
            Utf8Path::new("dl"),
            &HashSet::<Utf8PathBuf>::new(),
            &BuildOptions::default(),
        );
        let value = serde_json::to_value(&jobs[0]).unwrap();
        assert_eq!(value["destination"], "dl/breast/single-end/SRR1.fastq.gz");
    }
}
