use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CuratorError;

pub const CONFIG_FILE_NAME: &str = "rnaseq-curator.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub paths: Option<PathsEntry>,
    #[serde(default)]
    pub duplicates: Option<DuplicatesEntry>,
    #[serde(default)]
    pub quality: Option<QualityEntry>,
    #[serde(default)]
    pub download: Option<DownloadEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PathsEntry {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub report_dir: Option<String>,
    #[serde(default)]
    pub download_root: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DuplicatesEntry {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub numeric_tolerance: Option<f64>,
    #[serde(default)]
    pub conflict_title_similarity: Option<f64>,
    #[serde(default)]
    pub report_label_conflicts: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct QualityEntry {
    #[serde(default)]
    pub min_read_length: Option<f64>,
    #[serde(default)]
    pub min_base_count: Option<f64>,
    #[serde(default)]
    pub min_reads_per_sample: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadEntry {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_secs: Option<f64>,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,
    #[serde(default)]
    pub validate_gzip: Option<bool>,
    #[serde(default)]
    pub sample_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathsConfig {
    /// Source tables in, consolidated manifest and reports out.
    pub data_dir: Utf8PathBuf,
    /// Download report and failure list.
    pub report_dir: Utf8PathBuf,
    pub download_root: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateConfig {
    pub threshold: f64,
    pub numeric_tolerance: f64,
    pub conflict_title_similarity: f64,
    pub report_label_conflicts: bool,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            numeric_tolerance: 0.10,
            conflict_title_similarity: 0.8,
            report_label_conflicts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityConfig {
    pub min_read_length: f64,
    pub min_base_count: f64,
    pub min_reads_per_sample: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_read_length: 50.0,
            min_base_count: 1e9,
            min_reads_per_sample: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    pub max_workers: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub requests_per_second: f64,
    pub transfer_timeout: Duration,
    pub validate_gzip: bool,
    pub sample_limit: Option<usize>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            requests_per_second: 3.0,
            transfer_timeout: Duration::from_secs(3600),
            validate_gzip: true,
            sample_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub paths: PathsConfig,
    pub duplicates: DuplicateConfig,
    pub quality: QualityConfig,
    pub download: DownloadConfig,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            paths: PathsConfig {
                data_dir: Utf8PathBuf::from("output/data"),
                report_dir: Utf8PathBuf::from("output/results"),
                download_root: Utf8PathBuf::from("fastq_downloads"),
            },
            duplicates: DuplicateConfig::default(),
            quality: QualityConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path, then `./rnaseq-curator.json`, then the per-user config dir.
    /// With none of them present the defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CuratorError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            tracing::debug!("no config file found, using defaults");
            return Self::resolve_config(Config::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CuratorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CuratorError::ConfigParse(err.to_string()))?;
        tracing::info!(path = %config_path.display(), "loaded config");

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "rnaseq-curator")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CuratorError> {
        let defaults = ResolvedConfig::default();
        let paths = config.paths.unwrap_or_default();
        let duplicates = config.duplicates.unwrap_or_default();
        let quality = config.quality.unwrap_or_default();
        let download = config.download.unwrap_or_default();

        let resolved = ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            paths: PathsConfig {
                data_dir: paths
                    .data_dir
                    .map(Utf8PathBuf::from)
                    .unwrap_or(defaults.paths.data_dir),
                report_dir: paths
                    .report_dir
                    .map(Utf8PathBuf::from)
                    .unwrap_or(defaults.paths.report_dir),
                download_root: paths
                    .download_root
                    .map(Utf8PathBuf::from)
                    .unwrap_or(defaults.paths.download_root),
            },
            duplicates: DuplicateConfig {
                threshold: duplicates
                    .threshold
                    .unwrap_or(defaults.duplicates.threshold),
                numeric_tolerance: duplicates
                    .numeric_tolerance
                    .unwrap_or(defaults.duplicates.numeric_tolerance),
                conflict_title_similarity: duplicates
                    .conflict_title_similarity
                    .unwrap_or(defaults.duplicates.conflict_title_similarity),
                report_label_conflicts: duplicates
                    .report_label_conflicts
                    .unwrap_or(defaults.duplicates.report_label_conflicts),
            },
            quality: QualityConfig {
                min_read_length: quality
                    .min_read_length
                    .unwrap_or(defaults.quality.min_read_length),
                min_base_count: quality
                    .min_base_count
                    .unwrap_or(defaults.quality.min_base_count),
                min_reads_per_sample: quality
                    .min_reads_per_sample
                    .unwrap_or(defaults.quality.min_reads_per_sample),
            },
            download: DownloadConfig {
                max_workers: download
                    .max_workers
                    .unwrap_or(defaults.download.max_workers),
                max_attempts: download
                    .max_attempts
                    .unwrap_or(defaults.download.max_attempts),
                base_delay: download
                    .base_delay_secs
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.download.base_delay),
                requests_per_second: download
                    .requests_per_second
                    .unwrap_or(defaults.download.requests_per_second),
                transfer_timeout: download
                    .transfer_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.download.transfer_timeout),
                validate_gzip: download
                    .validate_gzip
                    .unwrap_or(defaults.download.validate_gzip),
                sample_limit: download.sample_limit,
            },
        };

        validate(&resolved)?;
        Ok(resolved)
    }
}

fn validate(config: &ResolvedConfig) -> Result<(), CuratorError> {
    let unit = |name: &str, value: f64| {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(CuratorError::InvalidConfig(format!(
                "{name} must be within 0..=1, got {value}"
            )))
        }
    };
    unit("duplicates.threshold", config.duplicates.threshold)?;
    unit(
        "duplicates.numeric_tolerance",
        config.duplicates.numeric_tolerance,
    )?;
    unit(
        "duplicates.conflict_title_similarity",
        config.duplicates.conflict_title_similarity,
    )?;

    if config.download.max_workers == 0 {
        return Err(CuratorError::InvalidConfig(
            "download.max_workers must be positive".to_string(),
        ));
    }
    if config.download.max_attempts == 0 {
        return Err(CuratorError::InvalidConfig(
            "download.max_attempts must be positive".to_string(),
        ));
    }
    if !(config.download.requests_per_second > 0.0) {
        return Err(CuratorError::InvalidConfig(
            "download.requests_per_second must be positive".to_string(),
        ));
    }
    if config.quality.min_read_length < 0.0 || config.quality.min_base_count < 0.0 {
        return Err(CuratorError::InvalidConfig(
            "quality thresholds must not be negative".to_string(),
        ));
    }
    Ok(())
}
