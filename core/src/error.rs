use thiserror::Error;

use crate::scanner::ScanKey;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("schema mismatch: {}", describe_missing(.table, .column.as_deref()))]
    SchemaMismatch {
        table: String,
        column: Option<String>,
    },
    #[error("scan of {table} interrupted {}: {source}", describe_cursor(.last_key.as_ref()))]
    ScanInterrupted {
        table: String,
        last_key: Option<ScanKey>,
        #[source]
        source: rusqlite::Error,
    },
    #[error("field integrity error in {table} row {row}: {detail}")]
    FieldIntegrity {
        table: String,
        row: String,
        detail: String,
    },
    #[error("failed to write image {content_id}: {source}")]
    BlobWrite {
        content_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write export: {0}")]
    ExportWrite(String),
}

impl CoreError {
    /// Row-local errors are recorded and the row skipped; everything else ends the pass.
    pub fn is_row_local(&self) -> bool {
        matches!(self, CoreError::FieldIntegrity { .. } | CoreError::BlobWrite { .. })
    }
}

fn describe_missing(table: &str, column: Option<&str>) -> String {
    match column {
        Some(column) => format!("table {table} has no column {column}"),
        None => format!("table {table} not found"),
    }
}

fn describe_cursor(last_key: Option<&ScanKey>) -> String {
    match last_key {
        Some(key) => format!("after key {key}"),
        None => "before the first row".to_string(),
    }
}
