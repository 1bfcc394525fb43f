use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    FieldIntegrity,
    BlobWrite,
    EmptyPayload,
    InvalidTimestamp,
    CellTruncated,
    ScanResumed,
    UnkeyedRows,
    LowDiskSpace,
}

/// One attributable event: every skipped row produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub ts: String,
    pub kind: DiagnosticKind,
    pub pass: String,
    pub table: Option<String>,
    pub row: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, pass: &str, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            kind,
            pass: pass.to_string(),
            table: None,
            row: None,
            message: message.into(),
        }
    }

    pub fn at_row(mut self, table: &str, row: impl Into<String>) -> Self {
        self.table = Some(table.to_string());
        self.row = Some(row.into());
        self
    }
}

pub trait DiagnosticSink {
    fn record(&mut self, event: &Diagnostic) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps nothing; events still reach the tracing subscriber through the run context.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl DiagnosticSink for DiscardSink {
    fn record(&mut self, _event: &Diagnostic) -> io::Result<()> {
        Ok(())
    }
}

/// Shared in-memory buffer; clones see the same events.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Rc<RefCell<Vec<Diagnostic>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.borrow().clone()
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&mut self, event: &Diagnostic) -> io::Result<()> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for JsonlSink {
    fn record(&mut self, event: &Diagnostic) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
