use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use thiserror::Error;

use crate::domain::ReadPart;
use crate::error::CuratorError;
use crate::jobs::{DownloadJob, Protocol};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transient transfer failure: {0}")]
    Transient(String),

    #[error("permanent transfer failure: {0}")]
    Permanent(String),

    /// Disk full or destination unwritable; aborts the whole run.
    #[error("fatal transfer failure: {0}")]
    Fatal(String),
}

impl TransferError {
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        let message = format!("{context}: {err}");
        if is_resource_exhaustion(err) {
            TransferError::Fatal(message)
        } else {
            TransferError::Transient(message)
        }
    }
}

pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ReadOnlyFilesystem
            | io::ErrorKind::QuotaExceeded
    )
}

/// Retrieves one artifact into a staging path chosen by the scheduler.
pub trait TransferClient: Send + Sync {
    fn fetch(&self, job: &DownloadJob, staging: &Utf8Path) -> Result<(), TransferError>;
}

#[derive(Clone)]
pub struct HttpTransferClient {
    client: Client,
    api_key: Option<String>,
}

impl HttpTransferClient {
    pub fn new(timeout: Duration) -> Result<Self, CuratorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("rnaseq-curator/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CuratorError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| CuratorError::HttpClient(err.to_string()))?;
        let api_key = std::env::var("NCBI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        Ok(Self { client, api_key })
    }

    /// Archive ftp mirrors are also served over https.
    pub fn normalize_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("ftp://") {
            return format!("https://{rest}");
        }
        url.to_string()
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<(), TransferError> {
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = format!("HTTP {status} from {}", response.url());
            return Err(classify_status(status, message));
        }
        let file =
            File::create(destination).map_err(|err| TransferError::from_io(&err, "create"))?;
        let mut writer = BufWriter::new(file);
        io::copy(&mut response, &mut writer)
            .map_err(|err| TransferError::from_io(&err, "write"))?;
        writer
            .into_inner()
            .map_err(|err| TransferError::from_io(err.error(), "flush"))?;
        Ok(())
    }
}

impl TransferClient for HttpTransferClient {
    fn fetch(&self, job: &DownloadJob, staging: &Utf8Path) -> Result<(), TransferError> {
        let url = Self::normalize_url(&job.source_uri);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            if url.contains("ncbi.nlm.nih.gov") {
                request = request.header("api-key", key.as_str());
            }
        }
        tracing::debug!(job = %job.label(), %url, "http transfer");
        let response = request.send().map_err(|err| {
            if err.is_builder() {
                TransferError::Permanent(format!("invalid url {url}: {err}"))
            } else {
                TransferError::Transient(err.to_string())
            }
        })?;
        self.write_response_to_file(response, staging.as_std_path())
    }
}

fn classify_status(status: u16, message: String) -> TransferError {
    match status {
        429 | 500..=599 | 408 => TransferError::Transient(message),
        _ => TransferError::Permanent(message),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub prefetch: Option<String>,
    pub sra_toolkit: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ToolStatus {
    Ready,
    Missing { message: String },
}

/// SRA runs through `prefetch` + `fasterq-dump`, recompressed with gzip.
///
/// A paired run is dumped once into `.<accession>.work` next to its destination; the
/// job for the other mate picks its file up from there instead of dumping again.
pub struct SequenceDumpClient {
    prefetch: Option<PathBuf>,
    fasterq_dump: Option<PathBuf>,
    dumps: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for SequenceDumpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceDumpClient {
    pub fn new() -> Self {
        Self::with_tools(find_in_path("prefetch"), find_in_path("fasterq-dump"))
    }

    pub fn with_tools(prefetch: Option<PathBuf>, fasterq_dump: Option<PathBuf>) -> Self {
        Self {
            prefetch,
            fasterq_dump,
            dumps: Mutex::new(HashMap::new()),
        }
    }

    fn dump_lock(&self, accession: &str) -> Arc<Mutex<()>> {
        self.dumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(accession.to_string())
            .or_default()
            .clone()
    }

    pub fn tool_status(&self) -> ToolStatus {
        if self.fasterq_dump.is_none() {
            return ToolStatus::Missing {
                message: "missing fasterq-dump (SRA Toolkit)".to_string(),
            };
        }
        ToolStatus::Ready
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            prefetch: self
                .prefetch
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
            sra_toolkit: self
                .fasterq_dump
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
        }
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), TransferError> {
        let output = Command::new(program).args(args).output().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                TransferError::Permanent(format!("{} not runnable: {err}", program.display()))
            } else {
                TransferError::Transient(err.to_string())
            }
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", program.display())
        } else {
            stderr
        };
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("invalid accession") || lowered.contains("not found") {
            Err(TransferError::Permanent(message))
        } else {
            Err(TransferError::Transient(message))
        }
    }

    fn prefetch(
        &self,
        prefetch: &Path,
        accession: &str,
        work_dir: &Path,
    ) -> Result<PathBuf, TransferError> {
        let args = vec![
            accession.to_string(),
            "--output-directory".to_string(),
            work_dir.to_string_lossy().to_string(),
        ];
        self.run_cmd(prefetch, &args)?;
        find_first_ext(work_dir, "sra").ok_or_else(|| {
            TransferError::Transient("prefetch did not produce an .sra file".to_string())
        })
    }

    fn dump(&self, job: &DownloadJob, work_dir: &Path) -> Result<PathBuf, TransferError> {
        let fasterq = self
            .fasterq_dump
            .as_ref()
            .ok_or_else(|| TransferError::Permanent("missing fasterq-dump".to_string()))?;
        let accession = job.sample.accession.as_str();
        let input = match &self.prefetch {
            Some(prefetch) => self
                .prefetch(prefetch, accession, work_dir)?
                .to_string_lossy()
                .to_string(),
            None => accession.to_string(),
        };
        let mut args = vec![
            input,
            "--outdir".to_string(),
            work_dir.to_string_lossy().to_string(),
            "--temp".to_string(),
            work_dir.to_string_lossy().to_string(),
        ];
        if matches!(job.part, ReadPart::R1 | ReadPart::R2) {
            args.push("--split-files".to_string());
        }
        self.run_cmd(fasterq, &args)?;

        let wanted = dump_file_name(accession, job.part);
        let produced = find_exts(work_dir, "fastq");
        produced
            .iter()
            .find(|path| path.file_name().is_some_and(|name| name == wanted.as_str()))
            .or_else(|| match job.part {
                ReadPart::Single => produced.first(),
                _ => None,
            })
            .cloned()
            .ok_or_else(|| TransferError::Transient(format!("fasterq-dump did not produce {wanted}")))
    }
}

impl TransferClient for SequenceDumpClient {
    fn fetch(&self, job: &DownloadJob, staging: &Utf8Path) -> Result<(), TransferError> {
        let accession = job.sample.accession.as_str();
        let parent = staging.parent().unwrap_or(Utf8Path::new("."));
        let work_dir = parent.join(format!(".{accession}.work"));
        let lock = self.dump_lock(accession);
        let _dumping = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cached = work_dir.join(dump_file_name(accession, job.part));
        let fastq = if cached.as_std_path().is_file() {
            tracing::debug!(job = %job.label(), "reusing dump of sibling mate");
            cached.into_std_path_buf()
        } else {
            remove_work_dir(&work_dir);
            fs::create_dir_all(work_dir.as_std_path())
                .map_err(|err| TransferError::from_io(&err, "create work directory"))?;
            match self.dump(job, work_dir.as_std_path()) {
                Ok(fastq) => fastq,
                Err(err) => {
                    remove_work_dir(&work_dir);
                    return Err(err);
                }
            }
        };

        if let Err(err) = gzip_into(&fastq, staging.as_std_path()) {
            remove_work_dir(&work_dir);
            return Err(err);
        }
        if let Err(err) = fs::remove_file(&fastq) {
            tracing::debug!(path = %fastq.display(), %err, "failed to remove consumed dump");
        }
        let mate_pending = mate_destination(job).is_some_and(|mate| !mate.as_std_path().exists());
        if !mate_pending || find_exts(work_dir.as_std_path(), "fastq").is_empty() {
            remove_work_dir(&work_dir);
        }
        Ok(())
    }
}

fn dump_file_name(accession: &str, part: ReadPart) -> String {
    match part {
        ReadPart::R1 => format!("{accession}_1.fastq"),
        ReadPart::R2 => format!("{accession}_2.fastq"),
        _ => format!("{accession}.fastq"),
    }
}

/// Final destination of the other mate of a paired job.
fn mate_destination(job: &DownloadJob) -> Option<Utf8PathBuf> {
    let mate = match job.part {
        ReadPart::R1 => ReadPart::R2,
        ReadPart::R2 => ReadPart::R1,
        _ => return None,
    };
    let parent = job.destination.parent()?;
    Some(parent.join(format!("{}{}", job.sample.accession, mate.file_suffix())))
}

fn remove_work_dir(work_dir: &Utf8Path) {
    if let Err(err) = fs::remove_dir_all(work_dir.as_std_path()) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(%work_dir, %err, "failed to clean work directory");
        }
    }
}

fn gzip_into(source: &Path, destination: &Path) -> Result<(), TransferError> {
    let input = File::open(source).map_err(|err| TransferError::from_io(&err, "open dump"))?;
    let output =
        File::create(destination).map_err(|err| TransferError::from_io(&err, "create"))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)
        .map_err(|err| TransferError::from_io(&err, "compress"))?;
    let writer = encoder
        .finish()
        .map_err(|err| TransferError::from_io(&err, "compress"))?;
    writer
        .into_inner()
        .map_err(|err| TransferError::from_io(err.error(), "flush"))?;
    Ok(())
}

/// Routes each job to the collaborator for its protocol.
pub struct RegistryTransfers<S, H> {
    sequence: S,
    http: H,
}

impl<S: TransferClient, H: TransferClient> RegistryTransfers<S, H> {
    pub fn new(sequence: S, http: H) -> Self {
        Self { sequence, http }
    }
}

impl<S: TransferClient, H: TransferClient> TransferClient for RegistryTransfers<S, H> {
    fn fetch(&self, job: &DownloadJob, staging: &Utf8Path) -> Result<(), TransferError> {
        match job.protocol {
            Protocol::SequenceDump => self.sequence.fetch(job, staging),
            Protocol::DirectFile | Protocol::Supplementary => self.http.fetch(job, staging),
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(ext))
}

fn find_first_ext(root: &Path, ext: &str) -> Option<PathBuf> {
    find_exts(root, ext).into_iter().next()
}

fn find_exts(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if has_ext(&path, ext) {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Accession, SampleKey, Source};

    fn sra_job(dir: &Utf8Path, accession: &str, part: ReadPart) -> DownloadJob {
        DownloadJob::new(
            SampleKey {
                source: Source::Sra,
                accession: Accession::parse(Source::Sra, accession).unwrap(),
            },
            part,
            Protocol::SequenceDump,
            format!("sra://{accession}"),
            dir.join(format!("{accession}{}", part.file_suffix())),
            None,
        )
    }

    fn decode(path: &Utf8Path) -> String {
        let mut decoded = String::new();
        let mut decoder = flate2::read::GzDecoder::new(File::open(path).unwrap());
        io::Read::read_to_string(&mut decoder, &mut decoded).unwrap();
        decoded
    }

    /// Stand-in for `fasterq-dump`: logs each invocation and writes both mates.
    #[cfg(unix)]
    const FAKE_DUMP: &str = r#"#!/bin/sh
acc="$1"
out=.
while [ $# -gt 0 ]; do
  if [ "$1" = "--outdir" ]; then out="$2"; fi
  shift
done
echo "$acc" >> "CALLS"
printf '@m1\nACGT\n+\nIIII\n' > "$out/${acc}_1.fastq"
printf '@m2\nTTGG\n+\nIIII\n' > "$out/${acc}_2.fastq"
"#;

    #[cfg(unix)]
    #[test]
    fn paired_run_is_dumped_once_for_both_mates() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let calls = temp.path().join("calls.log");
        let tool = temp.path().join("fasterq-dump");
        fs::write(&tool, FAKE_DUMP.replace("CALLS", &calls.to_string_lossy())).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let dir = Utf8PathBuf::from_path_buf(temp.path().join("breast/paired-end")).unwrap();
        fs::create_dir_all(dir.as_std_path()).unwrap();
        let client = SequenceDumpClient::with_tools(None, Some(tool));

        let r1 = sra_job(&dir, "SRR5", ReadPart::R1);
        let r1_staging = dir.join("SRR5_R1.fastq.gz.part");
        client.fetch(&r1, &r1_staging).unwrap();
        assert!(dir.join(".SRR5.work/SRR5_2.fastq").as_std_path().is_file());

        let r2 = sra_job(&dir, "SRR5", ReadPart::R2);
        let r2_staging = dir.join("SRR5_R2.fastq.gz.part");
        client.fetch(&r2, &r2_staging).unwrap();

        assert_eq!(decode(&r1_staging), "@m1\nACGT\n+\nIIII\n");
        assert_eq!(decode(&r2_staging), "@m2\nTTGG\n+\nIIII\n");
        assert_eq!(fs::read_to_string(&calls).unwrap().lines().count(), 1);
        assert!(!dir.join(".SRR5.work").as_std_path().exists());
    }

    #[test]
    fn mate_destination_points_at_sibling_part() {
        let dir = Utf8Path::new("dl/breast/paired-end");
        assert_eq!(
            mate_destination(&sra_job(dir, "SRR5", ReadPart::R1)),
            Some(Utf8PathBuf::from("dl/breast/paired-end/SRR5_R2.fastq.gz"))
        );
        assert_eq!(mate_destination(&sra_job(dir, "SRR5", ReadPart::Single)), None);
    }

    #[test]
    fn ftp_urls_are_served_over_https() {
        assert_eq!(
            HttpTransferClient::normalize_url(
                "ftp://ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/ERR123456/ERR123456.fastq.gz"
            ),
            "https://ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/ERR123456/ERR123456.fastq.gz"
        );
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(404, String::new()),
            TransferError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(403, String::new()),
            TransferError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(503, String::new()),
            TransferError::Transient(_)
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            TransferError::Transient(_)
        ));
    }

    #[test]
    fn storage_full_is_fatal() {
        let err = io::Error::from(io::ErrorKind::StorageFull);
        assert!(matches!(
            TransferError::from_io(&err, "write"),
            TransferError::Fatal(_)
        ));
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            TransferError::from_io(&err, "write"),
            TransferError::Transient(_)
        ));
    }

    #[test]
    fn gzip_into_produces_decodable_stream() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("SRR1.fastq");
        fs::write(&source, b"@r\nACGT\n+\nIIII\n").unwrap();
        let destination = temp.path().join("SRR1.fastq.gz.part");
        gzip_into(&source, &destination).unwrap();

        let destination = Utf8PathBuf::from_path_buf(destination).unwrap();
        assert_eq!(decode(&destination), "@r\nACGT\n+\nIIII\n");
    }
}
