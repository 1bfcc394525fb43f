//! Run state threaded explicitly through every pass: counters, diagnostics, identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, DiscardSink};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Membership,
    PrivateMessages,
    GroupMessages,
    Content,
    Images,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Membership => "membership",
            Pass::PrivateMessages => "private_messages",
            Pass::GroupMessages => "group_messages",
            Pass::Content => "content",
            Pass::Images => "images",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    pub scanned: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub resumed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStats {
    pub scanned: u64,
    pub written: u64,
    pub skipped_existing: u64,
    pub empty: u64,
    pub failed: u64,
    pub resumed: u64,
    pub bytes_written: u64,
}

/// A rejected messagesTable row is counted once, as skipped by the message pass that
/// owns it. The content pass reads the same rows again and does not count them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub membership: PassStats,
    pub private_messages: PassStats,
    pub group_messages: PassStats,
    pub content: PassStats,
    pub content_without_image: u64,
    /// Cells cut to fit the output format, each also recorded as a diagnostic.
    pub truncated_cells: u64,
    pub images: ImageStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub command: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub diagnostics: u64,
    pub artifacts: Vec<String>,
}

pub struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    stats: RunStats,
    sink: Box<dyn DiagnosticSink>,
    recorded: u64,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Box::new(DiscardSink))
    }
}

impl RunContext {
    pub fn new(sink: Box<dyn DiagnosticSink>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            stats: RunStats::default(),
            sink,
            recorded: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    pub fn diagnostics_recorded(&self) -> u64 {
        self.recorded
    }

    /// Counters shared by every row pass. The image pass keeps its own shape.
    pub fn pass_mut(&mut self, pass: Pass) -> Option<&mut PassStats> {
        match pass {
            Pass::Membership => Some(&mut self.stats.membership),
            Pass::PrivateMessages => Some(&mut self.stats.private_messages),
            Pass::GroupMessages => Some(&mut self.stats.group_messages),
            Pass::Content => Some(&mut self.stats.content),
            Pass::Images => None,
        }
    }

    pub fn note_scanned(&mut self, pass: Pass) {
        match self.pass_mut(pass) {
            Some(stats) => stats.scanned += 1,
            None => self.stats.images.scanned += 1,
        }
    }

    pub fn note_emitted(&mut self, pass: Pass) {
        if let Some(stats) = self.pass_mut(pass) {
            stats.emitted += 1;
        }
    }

    pub fn note_resumed(&mut self, pass: Pass) {
        match self.pass_mut(pass) {
            Some(stats) => stats.resumed += 1,
            None => self.stats.images.resumed += 1,
        }
    }

    pub fn record(&mut self, event: Diagnostic) {
        self.recorded += 1;
        warn!(
            kind = ?event.kind,
            pass = %event.pass,
            table = event.table.as_deref().unwrap_or("-"),
            row = event.row.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );
        if let Err(err) = self.sink.record(&event) {
            error!("failed to record diagnostic: {}", err);
        }
    }

    /// Records a row-local error and counts the row as skipped (or failed, for images).
    pub fn skip_row(&mut self, pass: Pass, err: &CoreError) {
        let kind = match err {
            CoreError::BlobWrite { .. } => DiagnosticKind::BlobWrite,
            _ => DiagnosticKind::FieldIntegrity,
        };
        let mut event = Diagnostic::new(kind, pass.as_str(), err.to_string());
        match err {
            CoreError::FieldIntegrity { table, row, .. } => {
                event = event.at_row(table, row.clone());
            }
            CoreError::BlobWrite { content_id, .. } => {
                event = event.at_row(crate::schema::IMAGE_TABLE, content_id.clone());
            }
            _ => {}
        }
        match self.pass_mut(pass) {
            Some(stats) => stats.skipped += 1,
            None => self.stats.images.failed += 1,
        }
        self.record(event);
    }

    pub fn summarize(&mut self, command: &str, source: &str, artifacts: Vec<String>) -> RunSummary {
        if let Err(err) = self.sink.flush() {
            error!("failed to flush diagnostics: {}", err);
        }
        RunSummary {
            run_id: self.run_id.clone(),
            command: command.to_string(),
            source: source.to_string(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            stats: self.stats.clone(),
            diagnostics: self.recorded,
            artifacts,
        }
    }
}
