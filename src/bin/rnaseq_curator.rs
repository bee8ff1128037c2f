use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use rnaseq_curator::app::{App, DownloadOptions};
use rnaseq_curator::config::{ConfigLoader, ResolvedConfig};
use rnaseq_curator::error::CuratorError;
use rnaseq_curator::output::{JsonOutput, OutputMode, TextOutput};
use rnaseq_curator::transfer::{
    HttpTransferClient, RegistryTransfers, SequenceDumpClient, ToolStatus,
};

#[derive(Parser)]
#[command(name = "rnaseq-curator")]
#[command(about = "Consolidate GEO/SRA/ENA RNA-seq metadata and download verified FASTQ files")]
#[command(version, author)]
struct Cli {
    /// Path to a JSON config file (default: ./rnaseq-curator.json).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print phase results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Normalize registry tables, detect duplicates and write the manifest")]
    Consolidate,
    #[command(about = "Download every missing artifact listed in the manifest")]
    Download(DownloadArgs),
    #[command(about = "Consolidate, then download")]
    Run(DownloadArgs),
}

#[derive(Args, Clone)]
struct DownloadArgs {
    /// Concurrent transfers (overrides config).
    #[arg(long)]
    workers: Option<usize>,

    /// Expand at most this many samples.
    #[arg(long)]
    limit: Option<usize>,

    /// Only retry parts that failed permanently in the previous run.
    #[arg(long)]
    retry_failed: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<CuratorError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CuratorError) -> u8 {
    match error {
        CuratorError::InvalidAccession { .. }
        | CuratorError::UnknownSource(_)
        | CuratorError::InvalidCancerType(_)
        | CuratorError::InvalidLayout(_)
        | CuratorError::InvalidQualityFlag(_)
        | CuratorError::InvalidPart(_)
        | CuratorError::ConfigRead(_)
        | CuratorError::ConfigParse(_)
        | CuratorError::InvalidConfig(_)
        | CuratorError::TableRead { .. }
        | CuratorError::EmptyManifest => 2,
        CuratorError::HttpClient(_) => 3,
        CuratorError::ResourceExhausted(_) | CuratorError::ReportWrite { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Consolidate => {
            let app = build_app(config)?;
            match output_mode {
                OutputMode::Json => {
                    let result = app.consolidate(&JsonOutput)?;
                    JsonOutput::print_consolidate(&result).into_diagnostic()
                }
                OutputMode::Text => {
                    let result = app.consolidate(&TextOutput)?;
                    TextOutput::print_consolidate(&result).into_diagnostic()
                }
            }
        }
        Commands::Download(args) => {
            let options = apply_download_args(&mut config, &args)?;
            let app = build_app(config)?;
            match output_mode {
                OutputMode::Json => {
                    let result = app.download(&options, &JsonOutput)?;
                    JsonOutput::print_download(&result).into_diagnostic()
                }
                OutputMode::Text => {
                    let result = app.download(&options, &TextOutput)?;
                    TextOutput::print_download(&result).into_diagnostic()
                }
            }
        }
        Commands::Run(args) => {
            let options = apply_download_args(&mut config, &args)?;
            let app = build_app(config)?;
            match output_mode {
                OutputMode::Json => {
                    let result = app.run(&options, &JsonOutput)?;
                    JsonOutput::print_run(&result).into_diagnostic()
                }
                OutputMode::Text => {
                    let result = app.run(&options, &TextOutput)?;
                    TextOutput::print_run(&result).into_diagnostic()
                }
            }
        }
    }
}

fn apply_download_args(
    config: &mut ResolvedConfig,
    args: &DownloadArgs,
) -> Result<DownloadOptions, CuratorError> {
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(CuratorError::InvalidConfig(
                "--workers must be at least 1".to_string(),
            ));
        }
        config.download.max_workers = workers;
    }
    Ok(DownloadOptions {
        limit: args.limit,
        retry_failed: args.retry_failed,
    })
}

type Transfers = RegistryTransfers<SequenceDumpClient, HttpTransferClient>;

fn build_app(config: ResolvedConfig) -> Result<App<Transfers>, CuratorError> {
    let sequence = SequenceDumpClient::new();
    tracing::debug!(tools = ?sequence.tool_info(), "sequence dump tools");
    if let ToolStatus::Missing { message } = sequence.tool_status() {
        tracing::warn!("{message}; SRA runs will fail");
    }
    let http = HttpTransferClient::new(config.download.transfer_timeout)?;
    Ok(App::new(config, RegistryTransfers::new(sequence, http)))
}
