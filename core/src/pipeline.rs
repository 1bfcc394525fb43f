//! Pass drivers for the two commands. Each pass is one key-paginated scan; row-local
//! errors are recorded in the run context and the scan continues.

use std::io;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::context::{Pass, RunContext};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::CoreError;
use crate::export::{
    content_row, message_row, Cell, HtmlSheetWriter, SheetWriter, XlsxSheetWriter,
    CONTENT_SHEET_COLUMNS, GROUP_SHEET, IMAGES_SHEET, MESSAGE_SHEET_COLUMNS, PRIVATE_SHEET,
};
use crate::extractor::{
    available_space, format_bytes, BlobExtractor, BlobOutcome, ExistingFilePolicy, ExtractedImage,
};
use crate::models::{ConversationKind, ImageRef, MessageRecord};
use crate::normalizer::{membership_from_row, ContentResolver, MembershipIndex, RecordNormalizer};
use crate::scanner::{
    RawRow, ScanSpec, TableScanner, DEFAULT_BLOB_CHUNK_SIZE, DEFAULT_CHUNK_SIZE,
};
use crate::schema::{
    validate_schema, EXPORT_REQUIREMENTS, IMAGE_KEY, IMAGE_REQUIREMENTS, IMAGE_TABLE,
    MEMBERS_TABLE, MEMBER_COLUMNS, MESSAGES_TABLE, MESSAGE_COLUMNS, MESSAGE_KEY,
    OPTIONAL_MESSAGE_COLUMNS,
};
use crate::source::{column_exists, open_source};
use crate::timestamps::Timestamp;

const PROGRESS_EVERY: u64 = 5000;
const IMAGE_PROGRESS_EVERY: u64 = 500;
const DEFAULT_SOURCE_NAME: &str = "kikDatabase.db";

pub const INDEX_COLUMNS: &[&str] = &["image_id", "filename", "extension", "size_bytes", "sha256", "status"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub chunk_size: usize,
    pub blob_chunk_size: usize,
    /// Resumes allowed per pass after `ScanInterrupted`.
    pub max_scan_retries: u32,
    pub existing_files: ExistingFilePolicy,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            max_scan_retries: 2,
            existing_files: ExistingFilePolicy::Skip,
        }
    }
}

fn source_file_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_SOURCE_NAME.to_string())
}

pub fn export_file_name(source: &Path) -> String {
    format!("Blue Kik Parsed - {}.xlsx", source_file_name(source))
}

pub fn image_dir_name(source: &Path) -> String {
    format!("{}_images", source_file_name(source))
}

pub fn image_index_name(source: &Path) -> String {
    format!("{}_image_index.csv", source_file_name(source))
}

pub fn report_file_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_file_name(source));
    format!("{stem}_Report.html")
}

pub const COMBINED_REPORT_NAME: &str = "Combined_Kik_Report.html";

/// Artifacts land next to the source unless an output directory is given.
pub fn output_dir_for(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => match source.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    }
}

/// Drives one scan to completion, resuming after `ScanInterrupted` from the last
/// consumed key at most `max_retries` times.
pub fn scan_with_resume<F>(
    conn: &Connection,
    spec: &ScanSpec,
    max_retries: u32,
    ctx: &mut RunContext,
    pass: Pass,
    mut on_row: F,
) -> Result<(), CoreError>
where
    F: FnMut(RawRow, &mut RunContext) -> Result<(), CoreError>,
{
    let mut scanner = TableScanner::open(conn, spec)?;
    let unkeyed = scanner.unkeyed_rows()?;
    if unkeyed > 0 {
        ctx.record(Diagnostic::new(
            DiagnosticKind::UnkeyedRows,
            pass.as_str(),
            format!(
                "{unkeyed} rows in {} have a null {} and are not scanned",
                spec.table, spec.key_column
            ),
        ));
    }

    let mut retries = 0;
    loop {
        match scanner.next() {
            None => break,
            Some(Ok(row)) => {
                ctx.note_scanned(pass);
                match on_row(row, ctx) {
                    Ok(()) => {}
                    Err(err) if err.is_row_local() => ctx.skip_row(pass, &err),
                    Err(err) => return Err(err),
                }
            }
            Some(Err(CoreError::ScanInterrupted {
                table,
                last_key,
                source,
            })) => {
                if retries >= max_retries {
                    return Err(CoreError::ScanInterrupted {
                        table,
                        last_key,
                        source,
                    });
                }
                retries += 1;
                let position = match &last_key {
                    Some(key) => format!("after key {key}"),
                    None => "from the start".to_string(),
                };
                ctx.note_resumed(pass);
                ctx.record(Diagnostic::new(
                    DiagnosticKind::ScanResumed,
                    pass.as_str(),
                    format!("scan of {table} resumed {position} (attempt {retries}/{max_retries}): {source}"),
                ));
                scanner = scanner.resume_after(last_key);
            }
            Some(Err(err)) => return Err(err),
        }
    }
    info!(pass = pass.as_str(), chunks = scanner.chunks_fetched(), "pass complete");
    Ok(())
}

pub fn load_membership(
    conn: &Connection,
    config: &ExtractConfig,
    ctx: &mut RunContext,
) -> Result<MembershipIndex, CoreError> {
    let spec = ScanSpec::new(MEMBERS_TABLE, "rowid", MEMBER_COLUMNS, config.chunk_size);
    let mut index = MembershipIndex::default();
    scan_with_resume(conn, &spec, config.max_scan_retries, ctx, Pass::Membership, |row, ctx| {
        index.insert(membership_from_row(&row)?);
        ctx.note_emitted(Pass::Membership);
        Ok(())
    })?;
    info!(
        groups = index.group_count(),
        members = index.member_count(),
        "group membership loaded"
    );
    Ok(index)
}

/// Required message columns plus whichever optional ones this backup has.
fn message_scan_spec(conn: &Connection, config: &ExtractConfig) -> Result<ScanSpec, CoreError> {
    let mut columns: Vec<&str> = MESSAGE_COLUMNS.to_vec();
    for &column in OPTIONAL_MESSAGE_COLUMNS {
        if column_exists(conn, MESSAGES_TABLE, column)? {
            columns.push(column);
        }
    }
    Ok(ScanSpec::new(MESSAGES_TABLE, MESSAGE_KEY, &columns, config.chunk_size))
}

fn note_invalid_timestamp(ctx: &mut RunContext, pass: Pass, record: &MessageRecord) {
    if let Timestamp::Invalid(raw) = record.timestamp {
        ctx.record(
            Diagnostic::new(
                DiagnosticKind::InvalidTimestamp,
                pass.as_str(),
                format!("timestamp {raw} is out of range; exported as unknown"),
            )
            .at_row(MESSAGES_TABLE, record.message_id.clone()),
        );
    }
}

/// Writes one row, first recording every cell the writer will have to cut.
fn emit_row<W: SheetWriter>(
    writer: &mut W,
    ctx: &mut RunContext,
    pass: Pass,
    sheet: &str,
    columns: &[&str],
    message_id: &str,
    row: &[Cell],
) -> Result<(), CoreError> {
    if let Some(limit) = writer.max_cell_chars() {
        for (column, cell) in columns.iter().zip(row) {
            let Some(text) = cell.as_text() else {
                continue;
            };
            if text.len() <= limit {
                continue;
            }
            let chars = text.chars().count();
            if chars > limit {
                ctx.stats_mut().truncated_cells += 1;
                ctx.record(
                    Diagnostic::new(
                        DiagnosticKind::CellTruncated,
                        pass.as_str(),
                        format!("{sheet} column {column} holds {chars} characters; cut to {limit}"),
                    )
                    .at_row(MESSAGES_TABLE, message_id),
                );
            }
        }
    }
    writer.write_row(row)
}

fn report_progress<F: Fn(&str)>(progress: &F, label: &str, scanned: u64, every: u64) {
    if scanned > 0 && scanned % every == 0 {
        progress(&format!("{label}... {scanned} rows"));
    }
}

/// Writes the three sections in order: private messages, group messages, images.
///
/// The messages table is scanned once per section. A row the normalizer rejects is
/// reported by the message pass it belongs to (the private pass when even its
/// conversation cannot be read) and never twice.
pub fn export_messages<W, F>(
    conn: &Connection,
    config: &ExtractConfig,
    ctx: &mut RunContext,
    mut writer: W,
    progress: &F,
) -> Result<W::Output, CoreError>
where
    W: SheetWriter,
    F: Fn(&str),
{
    progress("Loading group membership...");
    let membership = load_membership(conn, config, ctx)?;
    let normalizer = RecordNormalizer::new(&membership);
    let spec = message_scan_spec(conn, config)?;

    progress("Exporting private messages...");
    writer.begin_sheet(PRIVATE_SHEET, MESSAGE_SHEET_COLUMNS)?;
    scan_with_resume(conn, &spec, config.max_scan_retries, ctx, Pass::PrivateMessages, |row, ctx| {
        report_progress(progress, "Exporting private messages", ctx.stats().private_messages.scanned, PROGRESS_EVERY);
        if normalizer.classify(&row)? == ConversationKind::Group {
            return Ok(());
        }
        let record = normalizer.normalize_message(&row)?;
        note_invalid_timestamp(ctx, Pass::PrivateMessages, &record);
        emit_row(
            &mut writer,
            ctx,
            Pass::PrivateMessages,
            PRIVATE_SHEET,
            MESSAGE_SHEET_COLUMNS,
            &record.message_id,
            &message_row(&record),
        )?;
        ctx.note_emitted(Pass::PrivateMessages);
        Ok(())
    })?;

    progress("Exporting group messages...");
    writer.begin_sheet(GROUP_SHEET, MESSAGE_SHEET_COLUMNS)?;
    scan_with_resume(conn, &spec, config.max_scan_retries, ctx, Pass::GroupMessages, |row, ctx| {
        report_progress(progress, "Exporting group messages", ctx.stats().group_messages.scanned, PROGRESS_EVERY);
        match normalizer.classify(&row) {
            Ok(ConversationKind::Group) => {}
            Ok(ConversationKind::Private) | Err(_) => return Ok(()),
        }
        let record = normalizer.normalize_message(&row)?;
        note_invalid_timestamp(ctx, Pass::GroupMessages, &record);
        emit_row(
            &mut writer,
            ctx,
            Pass::GroupMessages,
            GROUP_SHEET,
            MESSAGE_SHEET_COLUMNS,
            &record.message_id,
            &message_row(&record),
        )?;
        ctx.note_emitted(Pass::GroupMessages);
        Ok(())
    })?;

    progress("Exporting images...");
    writer.begin_sheet(IMAGES_SHEET, CONTENT_SHEET_COLUMNS)?;
    let resolver = ContentResolver::new(conn)?;
    scan_with_resume(conn, &spec, config.max_scan_retries, ctx, Pass::Content, |row, ctx| {
        report_progress(progress, "Exporting images", ctx.stats().content.scanned, PROGRESS_EVERY);
        // Rejected rows were already reported and counted by the message pass.
        let record = match row.identifier("content_id") {
            Ok(None) => return Ok(()),
            Ok(Some(_)) => normalizer.normalize_message(&row),
            Err(err) => Err(err),
        };
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_row_local() => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some(item) = resolver.resolve(&record)? else {
            return Ok(());
        };
        if item.image == ImageRef::NoImageData {
            ctx.stats_mut().content_without_image += 1;
        }
        emit_row(
            &mut writer,
            ctx,
            Pass::Content,
            IMAGES_SHEET,
            CONTENT_SHEET_COLUMNS,
            &item.message_id,
            &content_row(&item),
        )?;
        ctx.note_emitted(Pass::Content);
        Ok(())
    })?;

    progress("Saving workbook...");
    writer.finish()
}

pub fn run_export(
    source: &Path,
    dest: &Path,
    config: &ExtractConfig,
    ctx: &mut RunContext,
) -> Result<PathBuf, CoreError> {
    run_export_with_progress(source, dest, config, ctx, |_| {})
}

pub fn run_export_with_progress<F>(
    source: &Path,
    dest: &Path,
    config: &ExtractConfig,
    ctx: &mut RunContext,
    progress: F,
) -> Result<PathBuf, CoreError>
where
    F: Fn(&str),
{
    progress("Opening backup...");
    let db = open_source(source)?;
    validate_schema(&db.conn, EXPORT_REQUIREMENTS)?;
    let writer = XlsxSheetWriter::create(dest)?;
    let path = export_messages(&db.conn, config, ctx, writer, &progress)?;
    log_export(ctx, &path);
    progress(&format!("Export complete: {}", path.display()));
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportExport {
    pub workbook: PathBuf,
    pub report: PathBuf,
}

/// Writes the workbook and, from the same passes, an HTML report whose image cells link
/// into `<file name>_images/` next to the report.
pub fn run_export_with_report<F>(
    source: &Path,
    dest: &Path,
    report: &Path,
    config: &ExtractConfig,
    ctx: &mut RunContext,
    progress: F,
) -> Result<ReportExport, CoreError>
where
    F: Fn(&str),
{
    progress("Opening backup...");
    let db = open_source(source)?;
    validate_schema(&db.conn, EXPORT_REQUIREMENTS)?;

    let image_dir = image_dir_name(source);
    let report_dir = output_dir_for(report, None);
    if !report_dir.join(&image_dir).is_dir() {
        warn!(
            dir = %report_dir.join(&image_dir).display(),
            "image directory not found; report image links stay broken until images are extracted"
        );
    }
    let title = format!("Kik Backup Report - {}", source_file_name(source));
    let writers = (
        XlsxSheetWriter::create(dest)?,
        HtmlSheetWriter::create(report, &title, Some(&image_dir))?,
    );
    let (workbook, report) = export_messages(&db.conn, config, ctx, writers, &progress)?;
    log_export(ctx, &workbook);
    info!(path = %report.display(), "report written");
    progress(&format!("Export complete: {}, {}", workbook.display(), report.display()));
    Ok(ReportExport { workbook, report })
}

fn log_export(ctx: &RunContext, path: &Path) {
    let stats = ctx.stats();
    if stats.truncated_cells > 0 {
        warn!(cells = stats.truncated_cells, "some cells were cut to fit the workbook");
    }
    info!(
        private = stats.private_messages.emitted,
        group = stats.group_messages.emitted,
        content = stats.content.emitted,
        path = %path.display(),
        "export written"
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtraction {
    pub image_dir: PathBuf,
    pub index_path: PathBuf,
}

#[derive(Serialize)]
struct IndexRow<'a> {
    image_id: &'a str,
    filename: &'a str,
    extension: &'a str,
    size_bytes: u64,
    sha256: &'a str,
    status: &'a str,
}

fn write_index_row<W: io::Write>(
    index: &mut csv::Writer<W>,
    image: &ExtractedImage,
    status: &str,
) -> Result<(), CoreError> {
    index
        .serialize(IndexRow {
            image_id: &image.image_id,
            filename: &image.file_name,
            extension: &image.extension,
            size_bytes: image.size_bytes,
            sha256: &image.sha256,
            status,
        })
        .map_err(index_error)
}

fn index_error(err: csv::Error) -> CoreError {
    CoreError::ExportWrite(format!("image index: {err}"))
}

/// Scans the payload table and hands every blob to the extractor, one chunk in memory at a time.
pub fn extract_images<W, F>(
    conn: &Connection,
    extractor: &BlobExtractor,
    index: &mut csv::Writer<W>,
    config: &ExtractConfig,
    ctx: &mut RunContext,
    progress: &F,
) -> Result<(), CoreError>
where
    W: io::Write,
    F: Fn(&str),
{
    let spec = ScanSpec::new(IMAGE_TABLE, IMAGE_KEY, &["image_bytes"], config.blob_chunk_size);
    info!(
        dir = %extractor.out_dir().display(),
        policy = ?extractor.policy(),
        "extracting images"
    );
    scan_with_resume(conn, &spec, config.max_scan_retries, ctx, Pass::Images, |mut row, ctx| {
        report_progress(progress, "Extracting images", ctx.stats().images.scanned, IMAGE_PROGRESS_EVERY);
        let image_id = row
            .identifier(IMAGE_KEY)?
            .ok_or_else(|| row.integrity("image_id is empty".to_string()))?;
        let bytes = match row.take_blob("image_bytes") {
            Ok(bytes) => bytes.unwrap_or_default(),
            Err(err) => match row.text("image_bytes") {
                Ok(Some(text)) => text.into_bytes(),
                _ => return Err(err),
            },
        };
        match extractor.extract(&image_id, &bytes)? {
            BlobOutcome::Empty => {
                ctx.stats_mut().images.empty += 1;
                ctx.record(
                    Diagnostic::new(
                        DiagnosticKind::EmptyPayload,
                        Pass::Images.as_str(),
                        format!("no image data for {image_id}"),
                    )
                    .at_row(IMAGE_TABLE, image_id),
                );
            }
            BlobOutcome::Written(image) => {
                let stats = &mut ctx.stats_mut().images;
                stats.written += 1;
                stats.bytes_written += image.size_bytes;
                write_index_row(index, &image, "written")?;
            }
            BlobOutcome::SkippedExisting(image) => {
                ctx.stats_mut().images.skipped_existing += 1;
                write_index_row(index, &image, "skipped_existing")?;
            }
        }
        Ok(())
    })
}

/// Compares the total payload size with the free space under `dir`. A shortfall is a
/// warning only; each failed write is still reported as it happens.
fn preflight_disk_space(conn: &Connection, dir: &Path, ctx: &mut RunContext) -> Result<(), CoreError> {
    let needed: i64 = conn.query_row(
        &format!("SELECT COALESCE(SUM(length(image_bytes)), 0) FROM {IMAGE_TABLE};"),
        [],
        |row| row.get(0),
    )?;
    note_disk_space(ctx, dir, needed.max(0) as u64, available_space(dir));
    Ok(())
}

fn note_disk_space(ctx: &mut RunContext, dir: &Path, needed: u64, free: Option<u64>) {
    match free {
        Some(free) if free < needed => ctx.record(Diagnostic::new(
            DiagnosticKind::LowDiskSpace,
            Pass::Images.as_str(),
            format!(
                "image payloads need ~{}, {} has {} free",
                format_bytes(needed),
                dir.display(),
                format_bytes(free)
            ),
        )),
        Some(_) => {}
        None => warn!(dir = %dir.display(), "free space unknown; skipping disk check"),
    }
}

pub fn run_image_extraction(
    source: &Path,
    out_dir: &Path,
    config: &ExtractConfig,
    ctx: &mut RunContext,
) -> Result<ImageExtraction, CoreError> {
    run_image_extraction_with_progress(source, out_dir, config, ctx, |_| {})
}

/// Writes `<name>_images/` and `<name>_image_index.csv` under `out_dir`. The index is
/// persisted only after the whole pass succeeds.
pub fn run_image_extraction_with_progress<F>(
    source: &Path,
    out_dir: &Path,
    config: &ExtractConfig,
    ctx: &mut RunContext,
    progress: F,
) -> Result<ImageExtraction, CoreError>
where
    F: Fn(&str),
{
    progress("Opening backup...");
    let db = open_source(source)?;
    validate_schema(&db.conn, IMAGE_REQUIREMENTS)?;

    let image_dir = out_dir.join(image_dir_name(source));
    let index_path = out_dir.join(image_index_name(source));
    let extractor = BlobExtractor::new(&image_dir, config.existing_files)?;
    preflight_disk_space(&db.conn, &image_dir, ctx)?;

    progress("Extracting images...");
    let temp = NamedTempFile::new_in(out_dir)?;
    {
        let mut index = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(temp.as_file());
        index.write_record(INDEX_COLUMNS).map_err(index_error)?;
        extract_images(&db.conn, &extractor, &mut index, config, ctx, &progress)?;
        index.flush()?;
    }
    temp.persist(&index_path).map_err(|e| {
        CoreError::ExportWrite(format!("persist {} failed: {}", index_path.display(), e.error))
    })?;

    let stats = &ctx.stats().images;
    if stats.failed > 0 {
        warn!(failed = stats.failed, "some images could not be written");
    }
    info!(
        written = stats.written,
        skipped_existing = stats.skipped_existing,
        empty = stats.empty,
        failed = stats.failed,
        bytes = %format_bytes(stats.bytes_written),
        "image extraction complete"
    );
    progress(&format!(
        "Images extracted: written {}, already present {}, empty {}, failed {}",
        stats.written, stats.skipped_existing, stats.empty, stats.failed
    ));
    Ok(ImageExtraction {
        image_dir,
        index_path,
    })
}
