//! Browsable report: one tab per sheet, image cells shown inline and linked to the
//! extracted file. Rows are streamed to a temporary file as they arrive.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{Cell, SheetWriter};
use crate::error::CoreError;

const REPORT_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>
body { font-family: Arial, sans-serif; margin: 20px; }
.tabs { display: flex; margin-bottom: 10px; }
.tab-button { padding: 8px 12px; margin-right: 6px; border: 1px solid #ccc; background: #f0f0f0; cursor: pointer; }
.tab { display: none; }
.tab.active { display: block; }
table { width: 100%; border-collapse: collapse; margin-bottom: 20px; }
th, td { border: 1px solid #ddd; padding: 6px; text-align: left; vertical-align: top; }
th { background: #f4f4f4; }
td { white-space: pre-wrap; word-break: break-word; }
img { max-width: 150px; height: auto; display: block; }
</style>
<script>
function showTab(id) {
  document.querySelectorAll('.tab').forEach(function (tab) { tab.classList.remove('active'); });
  document.getElementById(id).classList.add('active');
}
</script>
</head>
<body>
<h1>{title}</h1>
<div class="tabs" id="tabs"></div>
"#;

const REPORT_TAIL: &str = r#"<script>
document.querySelectorAll('.tab').forEach(function (tab, idx) {
  var button = document.createElement('div');
  button.className = 'tab-button';
  button.textContent = tab.dataset.title;
  button.onclick = function () { showTab(tab.id); };
  document.getElementById('tabs').appendChild(button);
  if (idx === 0) { showTab(tab.id); }
});
</script>
</body>
</html>
"#;

struct OpenSection {
    name: String,
    columns: usize,
    rows: u64,
}

/// Writes an HTML report. `image_dir` is the image directory relative to the report;
/// without it image cells are plain file names.
pub struct HtmlSheetWriter {
    dest: PathBuf,
    out: BufWriter<NamedTempFile>,
    image_dir: Option<String>,
    current: Option<OpenSection>,
}

impl HtmlSheetWriter {
    pub fn create(dest: &Path, title: &str, image_dir: Option<&str>) -> Result<Self, CoreError> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| report_error(dest, e))?;
        let temp = NamedTempFile::new_in(&dir).map_err(|e| report_error(dest, e))?;
        let mut out = BufWriter::new(temp);
        out.write_all(REPORT_HEAD.replace("{title}", &escape_html(title)).as_bytes())
            .map_err(|e| report_error(dest, e))?;
        Ok(Self {
            dest: dest.to_path_buf(),
            out,
            image_dir: image_dir.map(str::to_string),
            current: None,
        })
    }

    fn close_section(&mut self) -> io::Result<()> {
        if let Some(section) = self.current.take() {
            self.out.write_all(b"</table>\n</div>\n")?;
            debug!(section = %section.name, rows = section.rows, "report section complete");
        }
        Ok(())
    }

    fn write_cell(&mut self, cell: &Cell) -> io::Result<()> {
        match cell {
            Cell::Empty => self.out.write_all(b"<td></td>"),
            Cell::Integer(value) => write!(self.out, "<td>{value}</td>"),
            Cell::Text(value) => write!(self.out, "<td>{}</td>", escape_html(value)),
            Cell::File(name) => match &self.image_dir {
                Some(dir) => {
                    let href = escape_html(&format!("{}/{}", href_segment(dir), href_segment(name)));
                    let label = escape_html(name);
                    write!(
                        self.out,
                        "<td><a href=\"{href}\"><img src=\"{href}\" alt=\"{label}\" loading=\"lazy\"></a>{label}</td>"
                    )
                }
                None => write!(self.out, "<td>{}</td>", escape_html(name)),
            },
        }
    }
}

impl SheetWriter for HtmlSheetWriter {
    type Output = PathBuf;

    fn begin_sheet(&mut self, name: &str, columns: &[&str]) -> Result<(), CoreError> {
        let dest = self.dest.clone();
        self.close_section().map_err(|e| report_error(&dest, e))?;
        let mut header = format!(
            "<div id=\"{}\" class=\"tab\" data-title=\"{}\">\n<h2>{}</h2>\n<table>\n<tr>",
            section_id(name),
            escape_html(name),
            escape_html(name)
        );
        for column in columns {
            header.push_str(&format!("<th>{}</th>", escape_html(column)));
        }
        header.push_str("</tr>\n");
        self.out
            .write_all(header.as_bytes())
            .map_err(|e| report_error(&dest, e))?;
        self.current = Some(OpenSection {
            name: name.to_string(),
            columns: columns.len(),
            rows: 0,
        });
        Ok(())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), CoreError> {
        let section = self
            .current
            .as_mut()
            .ok_or_else(|| CoreError::ExportWrite("row written before any sheet".to_string()))?;
        if row.len() != section.columns {
            return Err(CoreError::ExportWrite(format!(
                "sheet {} expects {} cells, got {}",
                section.name,
                section.columns,
                row.len()
            )));
        }
        section.rows += 1;
        let dest = self.dest.clone();
        let result = (|| -> io::Result<()> {
            self.out.write_all(b"<tr>")?;
            for cell in row {
                self.write_cell(cell)?;
            }
            self.out.write_all(b"</tr>\n")
        })();
        result.map_err(|e| report_error(&dest, e))
    }

    fn finish(mut self) -> Result<PathBuf, CoreError> {
        let dest = self.dest.clone();
        self.close_section().map_err(|e| report_error(&dest, e))?;
        self.out
            .write_all(REPORT_TAIL.as_bytes())
            .map_err(|e| report_error(&dest, e))?;
        let temp = self
            .out
            .into_inner()
            .map_err(|e| CoreError::ExportWrite(format!("flush {} failed: {}", dest.display(), e.error())))?;
        temp.persist(&dest).map_err(|e| report_error(&dest, e.error))?;
        Ok(dest)
    }
}

/// One backup in a multi-backup index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportIndexEntry {
    pub source: String,
    pub report: PathBuf,
    pub private_messages: u64,
    pub group_messages: u64,
    pub content: u64,
}

/// Writes a page linking every per-backup report, with its row counts.
pub fn write_report_index(dest: &Path, entries: &[ReportIndexEntry]) -> Result<PathBuf, CoreError> {
    let base = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut page = REPORT_HEAD.replace("{title}", "Combined Kik Backup Report");
    page.push_str("<table>\n<tr><th>backup</th><th>report</th><th>private messages</th><th>group messages</th><th>images</th></tr>\n");
    for entry in entries {
        let href = relative_href(&base, &entry.report);
        page.push_str(&format!(
            "<tr><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&entry.source),
            escape_html(&href),
            escape_html(&entry.report.display().to_string()),
            entry.private_messages,
            entry.group_messages,
            entry.content
        ));
    }
    page.push_str("</table>\n</body>\n</html>\n");

    fs::create_dir_all(&base).map_err(|e| report_error(dest, e))?;
    let mut temp = NamedTempFile::new_in(&base).map_err(|e| report_error(dest, e))?;
    temp.write_all(page.as_bytes())
        .and_then(|_| temp.flush())
        .map_err(|e| report_error(dest, e))?;
    temp.persist(dest).map_err(|e| report_error(dest, e.error))?;
    Ok(dest.to_path_buf())
}

fn report_error(dest: &Path, err: io::Error) -> CoreError {
    CoreError::ExportWrite(format!("report {}: {}", dest.display(), err))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn section_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Percent-encodes one path segment. Extracted file names contain `%`, which a
/// browser would otherwise decode.
fn href_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn relative_href(base: &Path, target: &Path) -> String {
    let relative = target.strip_prefix(base).unwrap_or(target);
    let segments: Vec<String> = relative
        .iter()
        .map(|part| href_segment(&part.to_string_lossy()))
        .collect();
    let joined = segments.join("/");
    if relative.is_absolute() {
        format!("file://{}", joined.trim_start_matches("%2F"))
    } else {
        joined
    }
}
