//! Post-transfer integrity checks: non-empty, MD5 against the advertised digest,
//! and a full gzip decode for `.gz` artifacts.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumOutcome {
    Matched,
    Mismatch,
    /// No digest advertised by the registry.
    Skipped,
    /// Transfer never produced an artifact.
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub observed_checksum: String,
    pub outcome: ChecksumOutcome,
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("artifact is empty")]
    Empty,

    #[error("checksum mismatch: expected {expected}, observed {observed}")]
    Mismatch { expected: String, observed: String },

    #[error("gzip stream is truncated or corrupt: {0}")]
    Truncated(String),

    #[error("failed to read artifact: {0}")]
    Io(String),
}

impl IntegrityError {
    pub fn observed_checksum(&self) -> Option<&str> {
        match self {
            IntegrityError::Mismatch { observed, .. } => Some(observed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    pub validate_gzip: bool,
}

impl Verifier {
    pub fn new(validate_gzip: bool) -> Self {
        Self { validate_gzip }
    }

    /// `gzip` tells whether the final artifact name ends in `.gz`; the path being
    /// checked may still carry a staging suffix.
    pub fn verify(
        &self,
        path: &Path,
        expected: Option<&str>,
        gzip: bool,
    ) -> Result<Verification, IntegrityError> {
        let len = path
            .metadata()
            .map_err(|err| IntegrityError::Io(err.to_string()))?
            .len();
        if len == 0 {
            return Err(IntegrityError::Empty);
        }

        let observed = md5_hex(path).map_err(|err| IntegrityError::Io(err.to_string()))?;
        let outcome = match expected.map(str::trim).filter(|value| !value.is_empty()) {
            Some(expected) if expected.eq_ignore_ascii_case(&observed) => ChecksumOutcome::Matched,
            Some(expected) => {
                return Err(IntegrityError::Mismatch {
                    expected: expected.to_ascii_lowercase(),
                    observed,
                });
            }
            None => ChecksumOutcome::Skipped,
        };

        if gzip && self.validate_gzip {
            check_gzip(path)?;
        }

        Ok(Verification {
            observed_checksum: observed,
            outcome,
        })
    }
}

pub fn md5_hex(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

fn check_gzip(path: &Path) -> Result<(), IntegrityError> {
    let file = File::open(path).map_err(|err| IntegrityError::Io(err.to_string()))?;
    let mut decoder = MultiGzDecoder::new(file);
    io::copy(&mut decoder, &mut io::sink())
        .map(|_| ())
        .map_err(|err| IntegrityError::Truncated(err.to_string()))
}
