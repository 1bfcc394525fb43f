use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use blue_kik_core::diagnostics::{DiagnosticSink, DiscardSink, JsonlSink};
use blue_kik_core::export::{write_report_index, ReportIndexEntry};
use blue_kik_core::pipeline::{
    export_file_name, output_dir_for, report_file_name, run_export_with_progress,
    run_export_with_report, run_image_extraction_with_progress, COMBINED_REPORT_NAME,
};
use blue_kik_core::scanner::{DEFAULT_BLOB_CHUNK_SIZE, DEFAULT_CHUNK_SIZE};
use blue_kik_core::{ExistingFilePolicy, ExtractConfig, RunContext, RunSummary};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const BACKUP_EXTENSION: &str = "backup";

#[derive(Debug, Parser)]
#[command(name = "blue-kik")]
#[command(about = "Recover messages and images from Kik messenger backups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write private messages, group messages and image metadata to an xlsx workbook.
    Export(ExportArgs),
    /// Extract embedded image payloads to files and write an image index.
    Images(ImagesArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Backup database, or a directory searched for *.backup files.
    database: PathBuf,
    /// Where artifacts are written; defaults to the directory of each backup.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Append row-level diagnostics to this file as JSON lines.
    #[arg(long)]
    diagnostics: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    max_scan_retries: u32,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Also write an HTML report linking content rows to files from `images`.
    #[arg(long, default_value_t = false)]
    html: bool,
}

#[derive(Debug, Args)]
struct ImagesArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = DEFAULT_BLOB_CHUNK_SIZE)]
    chunk_size: usize,
    /// Rewrite image files that already exist instead of skipping them.
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "blue_kik=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Export(args) => run_export_command(args),
        Command::Images(args) => run_images_command(args),
    }
}

fn run_export_command(args: ExportArgs) -> Result<()> {
    let config = ExtractConfig {
        chunk_size: args.chunk_size,
        max_scan_retries: args.source.max_scan_retries,
        ..ExtractConfig::default()
    };
    let output_dir = args.source.output_dir.clone();
    let html = args.html;
    let outcome = run_sources(&args.source, "export", |source, ctx| {
        let out_dir = output_dir_for(source, output_dir.as_deref());
        let dest = out_dir.join(export_file_name(source));
        if html {
            let report = out_dir.join(report_file_name(source));
            let written =
                run_export_with_report(source, &dest, &report, &config, ctx, |msg| info!("{msg}"))
                    .with_context(|| format!("export of {} failed", source.display()))?;
            return Ok(vec![
                written.workbook.display().to_string(),
                written.report.display().to_string(),
            ]);
        }
        let path = run_export_with_progress(source, &dest, &config, ctx, |msg| info!("{msg}"))
            .with_context(|| format!("export of {} failed", source.display()))?;
        Ok(vec![path.display().to_string()])
    })?;

    if html && args.source.database.is_dir() && !outcome.summaries.is_empty() {
        let index_dir = output_dir.unwrap_or_else(|| args.source.database.clone());
        let entries: Vec<ReportIndexEntry> = outcome
            .summaries
            .iter()
            .filter_map(|summary| {
                let report = summary.artifacts.get(1)?;
                Some(ReportIndexEntry {
                    source: summary.source.clone(),
                    report: PathBuf::from(report),
                    private_messages: summary.stats.private_messages.emitted,
                    group_messages: summary.stats.group_messages.emitted,
                    content: summary.stats.content.emitted,
                })
            })
            .collect();
        let index = write_report_index(&index_dir.join(COMBINED_REPORT_NAME), &entries)
            .context("failed to write the combined report")?;
        info!(path = %index.display(), reports = entries.len(), "combined report written");
    }
    outcome.into_result()
}

fn run_images_command(args: ImagesArgs) -> Result<()> {
    let config = ExtractConfig {
        blob_chunk_size: args.chunk_size,
        max_scan_retries: args.source.max_scan_retries,
        existing_files: if args.overwrite {
            ExistingFilePolicy::Overwrite
        } else {
            ExistingFilePolicy::Skip
        },
        ..ExtractConfig::default()
    };
    let output_dir = args.source.output_dir.clone();
    let outcome = run_sources(&args.source, "images", |source, ctx| {
        let out_dir = output_dir_for(source, output_dir.as_deref());
        let extraction =
            run_image_extraction_with_progress(source, &out_dir, &config, ctx, |msg| info!("{msg}"))
                .with_context(|| format!("image extraction from {} failed", source.display()))?;
        Ok(vec![
            extraction.image_dir.display().to_string(),
            extraction.index_path.display().to_string(),
        ])
    })?;
    outcome.into_result()
}

struct SourcesOutcome {
    sources: usize,
    summaries: Vec<RunSummary>,
    failures: Vec<anyhow::Error>,
}

impl SourcesOutcome {
    fn into_result(mut self) -> Result<()> {
        match self.failures.len() {
            0 => Ok(()),
            1 if self.sources == 1 => Err(self.failures.remove(0)),
            failed => bail!("{} of {} backups failed", failed, self.sources),
        }
    }
}

/// Runs `run_one` for every backup, printing one JSON summary line per success.
/// Every source is attempted; the caller fails afterwards if any of them did.
fn run_sources<F>(args: &SourceArgs, command: &str, mut run_one: F) -> Result<SourcesOutcome>
where
    F: FnMut(&Path, &mut RunContext) -> Result<Vec<String>>,
{
    let sources = discover_sources(&args.database)?;
    let mut outcome = SourcesOutcome {
        sources: sources.len(),
        summaries: Vec::new(),
        failures: Vec::new(),
    };
    for source in &sources {
        let mut ctx = RunContext::new(open_sink(args.diagnostics.as_deref())?);
        info!(run_id = ctx.run_id(), source = %source.display(), command, "run started");
        match run_one(source, &mut ctx) {
            Ok(artifacts) => {
                let summary: RunSummary =
                    ctx.summarize(command, &source.display().to_string(), artifacts);
                println!("{}", serde_json::to_string(&summary)?);
                outcome.summaries.push(summary);
            }
            Err(err) => {
                error!("{:#}", err);
                outcome.failures.push(err);
            }
        }
    }
    Ok(outcome)
}

fn open_sink(path: Option<&Path>) -> Result<Box<dyn DiagnosticSink>> {
    match path {
        Some(path) => {
            let sink = JsonlSink::open(path)
                .with_context(|| format!("cannot open diagnostics file {}", path.display()))?;
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(DiscardSink)),
    }
}

fn discover_sources(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
        let is_backup = entry.path().extension().and_then(|ext| ext.to_str()) == Some(BACKUP_EXTENSION);
        if entry.file_type().is_file() && is_backup {
            found.push(entry.into_path());
        }
    }
    if found.is_empty() {
        bail!("no .{} files found under {}", BACKUP_EXTENSION, path.display());
    }
    Ok(found)
}
