use std::fs;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet, XlsxError};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Cell, SheetWriter};
use crate::error::CoreError;

/// Longest text a spreadsheet cell can hold.
pub const MAX_CELL_CHARS: usize = 32_767;
pub const TRUNCATION_MARKER: &str = " [truncated]";

const DEFAULT_WIDTH: f64 = 15.0;

fn column_width(column: &str) -> f64 {
    match column {
        "message_id" => 10.0,
        "conversation_id" => 25.0,
        "conversation_kind" => 12.0,
        "sender" => 10.0,
        "partner_jid" => 30.0,
        "timestamp" => 24.0,
        "body" => 100.0,
        "content_id" => 20.0,
        "participants" => 50.0,
        "content_names" => 30.0,
        "content_uri" => 50.0,
        "image_id" => 20.0,
        "image_file" => 30.0,
        "retain_count" => 15.0,
        "stat_msg" => 20.0,
        "stat_user_jid" => 30.0,
        "friend_attr_id" => 20.0,
        _ => DEFAULT_WIDTH,
    }
}

/// Returns the value unchanged when it fits, otherwise a prefix ending in the marker.
pub fn truncate_cell(value: &str) -> Option<String> {
    if value.chars().count() <= MAX_CELL_CHARS {
        return None;
    }
    let keep = MAX_CELL_CHARS - TRUNCATION_MARKER.chars().count();
    let mut out: String = value.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    Some(out)
}

struct OpenSheet {
    sheet: Worksheet,
    name: String,
    columns: usize,
    next_row: u32,
}

/// Writes an .xlsx workbook. The file appears at `dest` only when [`SheetWriter::finish`]
/// succeeds; a failed run leaves no partial workbook behind.
pub struct XlsxSheetWriter {
    dest: PathBuf,
    workbook: Workbook,
    current: Option<OpenSheet>,
    header: Format,
    body: Format,
}

impl XlsxSheetWriter {
    pub fn create(dest: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    CoreError::ExportWrite(format!("create {} failed: {}", parent.display(), e))
                })?;
            }
        }
        Ok(Self {
            dest: dest.to_path_buf(),
            workbook: Workbook::new(),
            current: None,
            header: Format::new().set_bold().set_align(FormatAlign::Top),
            body: Format::new().set_text_wrap().set_align(FormatAlign::Top),
        })
    }

    fn close_sheet(&mut self) -> Result<(), CoreError> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        let last_row = open.next_row.saturating_sub(1);
        let last_col = (open.columns.max(1) - 1) as u16;
        open.sheet
            .autofilter(0, 0, last_row, last_col)
            .map_err(export_error)?;
        debug!(sheet = %open.name, rows = last_row, "sheet complete");
        self.workbook.push_worksheet(open.sheet);
        Ok(())
    }
}

impl SheetWriter for XlsxSheetWriter {
    type Output = PathBuf;

    fn begin_sheet(&mut self, name: &str, columns: &[&str]) -> Result<(), CoreError> {
        self.close_sheet()?;
        let mut sheet = Worksheet::new();
        sheet.set_name(name).map_err(export_error)?;
        for (idx, column) in columns.iter().enumerate() {
            let col = idx as u16;
            sheet
                .set_column_width(col, column_width(column))
                .map_err(export_error)?;
            sheet
                .write_string_with_format(0, col, *column, &self.header)
                .map_err(export_error)?;
        }
        sheet.set_freeze_panes(1, 0).map_err(export_error)?;
        self.current = Some(OpenSheet {
            sheet,
            name: name.to_string(),
            columns: columns.len(),
            next_row: 1,
        });
        Ok(())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), CoreError> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| CoreError::ExportWrite("row written before any sheet".to_string()))?;
        if row.len() != open.columns {
            return Err(CoreError::ExportWrite(format!(
                "sheet {} expects {} cells, got {}",
                open.name,
                open.columns,
                row.len()
            )));
        }
        let row_idx = open.next_row;
        for (idx, cell) in row.iter().enumerate() {
            let col = idx as u16;
            match cell {
                Cell::Empty => {}
                Cell::Integer(value) => {
                    open.sheet
                        .write_number_with_format(row_idx, col, *value as f64, &self.body)
                        .map_err(export_error)?;
                }
                Cell::Text(value) | Cell::File(value) => {
                    let truncated = truncate_cell(value);
                    let text = truncated.as_deref().unwrap_or(value);
                    open.sheet
                        .write_string_with_format(row_idx, col, text, &self.body)
                        .map_err(export_error)?;
                }
            }
        }
        open.next_row += 1;
        Ok(())
    }

    fn max_cell_chars(&self) -> Option<usize> {
        Some(MAX_CELL_CHARS)
    }

    fn finish(mut self) -> Result<PathBuf, CoreError> {
        self.close_sheet()?;
        let dir = match self.dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(&dir)
            .map_err(|e| CoreError::ExportWrite(format!("temp file failed: {}", e)))?;
        self.workbook.save(temp.path()).map_err(export_error)?;
        temp.persist(&self.dest).map_err(|e| {
            CoreError::ExportWrite(format!("persist {} failed: {}", self.dest.display(), e.error))
        })?;
        Ok(self.dest)
    }
}

fn export_error(err: XlsxError) -> CoreError {
    CoreError::ExportWrite(err.to_string())
}
