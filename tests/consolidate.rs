use std::collections::HashSet;
use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use rnaseq_curator::app::PhaseStatus;
use rnaseq_curator::config::ResolvedConfig;
use rnaseq_curator::consolidate::{
    Consolidator, DUPLICATE_REPORT_FILE, MANIFEST_FILE, SUMMARY_FILE, table_file_name,
};
use rnaseq_curator::domain::{CancerType, QualityFlag, SequencingLayout, Source};
use rnaseq_curator::error::CuratorError;
use rnaseq_curator::manifest::read_manifest;

const GEO_TABLE: &str = "\
gse_id,title,organism,read_length,base_count,cancer_type
GSE1,breast cancer ER+,Homo sapiens,100,,breast
GSE2,melanoma immunotherapy response,Homo sapiens,,,
";

const SRA_TABLE: &str = "\
run_accession,title,organism,library_layout,read_length,base_count,read_count
SRX1,breast cancer ER positive,Homo sapiens,PAIRED,104,,5000000
SRR7,lung adenocarcinoma cohort,Homo sapiens,SINGLE,75,1500000000,50
SRR8,pancreatic cancer organoids,Homo sapiens,SINGLE,abc,2000000000,900000
srr7,lung adenocarcinoma cohort,Homo sapiens,SINGLE,75,1500000000,50
not-an-accession,ovarian cancer,Homo sapiens,SINGLE,100,2000000000,900000
";

fn data_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap()
}

fn write_table(dir: &Utf8PathBuf, source: Source, content: &str) {
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(dir.join(table_file_name(source)).as_std_path(), content).unwrap();
}

#[test]
fn consolidates_tables_and_links_cross_registry_duplicates() {
    let temp = tempfile::tempdir().unwrap();
    let dir = data_dir(&temp);
    write_table(&dir, Source::Geo, GEO_TABLE);
    write_table(&dir, Source::Sra, SRA_TABLE);

    let tables = Consolidator::load_tables(&dir).unwrap();
    let consolidation = Consolidator::new(&ResolvedConfig::default())
        .consolidate(tables)
        .unwrap();

    // ENA table is absent.
    assert_eq!(consolidation.status, PhaseStatus::Partial);
    assert_eq!(consolidation.warnings.len(), 1);
    assert_eq!(consolidation.warnings[0].source, Source::Ena);

    let keys: HashSet<_> = consolidation
        .manifest
        .iter()
        .map(|sample| sample.key().clone())
        .collect();
    assert_eq!(keys.len(), consolidation.manifest.len());
    assert_eq!(consolidation.manifest.len(), 5);

    let find = |accession: &str| {
        consolidation
            .manifest
            .iter()
            .find(|sample| sample.accession().as_str() == accession)
            .unwrap()
    };
    let geo = find("GSE1");
    let sra = find("SRX1");
    assert_eq!(geo.cancer_type, CancerType::Breast);
    assert_eq!(sra.sequencing_layout, SequencingLayout::Paired);
    assert!(geo.duplicate_group_id.is_some());
    assert_eq!(geo.duplicate_group_id, sra.duplicate_group_id);

    assert_eq!(find("SRR7").quality_flag, QualityFlag::Fail);
    assert_eq!(find("SRR8").quality_flag, QualityFlag::Unknown);
    assert_eq!(find("GSE2").cancer_type, CancerType::Melanoma);

    // Bad accession and the repeated SRR7 row are reported, not fatal.
    assert!(
        consolidation
            .issues
            .iter()
            .any(|issue| issue.accession.as_deref() == Some("not-an-accession"))
    );
    assert!(
        consolidation
            .issues
            .iter()
            .any(|issue| issue.reason.contains("duplicate"))
    );
}

#[test]
fn writes_manifest_report_and_summary() {
    let temp = tempfile::tempdir().unwrap();
    let dir = data_dir(&temp);
    write_table(&dir, Source::Geo, GEO_TABLE);
    write_table(&dir, Source::Sra, SRA_TABLE);

    let tables = Consolidator::load_tables(&dir).unwrap();
    let consolidation = Consolidator::new(&ResolvedConfig::default())
        .consolidate(tables)
        .unwrap();
    let outputs = Consolidator::write_outputs(&dir, &consolidation).unwrap();
    assert_eq!(outputs.len(), 3);

    let manifest = read_manifest(dir.join(MANIFEST_FILE).as_std_path()).unwrap();
    let columns = |samples: &[rnaseq_curator::domain::Sample]| {
        samples
            .iter()
            .map(|sample| {
                (
                    sample.key().clone(),
                    sample.cancer_type,
                    sample.quality_flag,
                    sample.duplicate_group_id.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(columns(&manifest), columns(&consolidation.manifest));

    let report = fs::read_to_string(dir.join(DUPLICATE_REPORT_FILE).as_std_path()).unwrap();
    assert!(report.contains("DG0001"));
    assert!(report.contains("GSE1"));
    assert!(report.contains("SRX1"));

    let summary = fs::read_to_string(dir.join(SUMMARY_FILE).as_std_path()).unwrap();
    assert!(summary.contains("Total Samples: 5"));
    assert!(summary.contains("ENA: source table missing"));
}

#[test]
fn nothing_to_consolidate_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let dir = data_dir(&temp);
    fs::create_dir_all(dir.as_std_path()).unwrap();

    let tables = Consolidator::load_tables(&dir).unwrap();
    assert!(tables.iter().all(|table| table.records.is_none()));
    assert_matches!(
        Consolidator::new(&ResolvedConfig::default()).consolidate(tables),
        Err(CuratorError::EmptyManifest)
    );
}
