use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CuratorError {
    #[error("invalid {source_name} accession: {value}")]
    InvalidAccession { source_name: String, value: String },

    #[error("unknown registry: {0}")]
    UnknownSource(String),

    #[error("invalid cancer type: {0}")]
    InvalidCancerType(String),

    #[error("invalid sequencing layout: {0}")]
    InvalidLayout(String),

    #[error("invalid quality flag: {0}")]
    InvalidQualityFlag(String),

    #[error("invalid read part: {0}")]
    InvalidPart(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read table {path}: {message}")]
    TableRead { path: PathBuf, message: String },

    #[error("failed to write report {path}: {message}")]
    ReportWrite { path: PathBuf, message: String },

    #[error("no samples available from any registry")]
    EmptyManifest,

    #[error("invalid job transition for {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("destination storage exhausted: {0}")]
    #[diagnostic(help("free disk space or choose another download root, then rerun"))]
    ResourceExhausted(String),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    #[error("download worker panicked")]
    WorkerPanic,
}
