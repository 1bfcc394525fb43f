use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::CoreError;

/// A Kik backup opened for reading. The handle is released when this value drops.
pub struct SourceDb {
    pub path: PathBuf,
    pub conn: Connection,
}

pub fn open_source(path: impl AsRef<Path>) -> Result<SourceDb, CoreError> {
    let path = path.as_ref().to_path_buf();
    if !path.exists() {
        return Err(CoreError::InvalidArgument(format!(
            "backup file not found: {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(CoreError::InvalidArgument(format!(
            "backup path is not a file: {}",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA query_only = ON;")?;
    Ok(SourceDb { path, conn })
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, CoreError> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1;",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, CoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1);")?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
    let mut columns = Vec::new();
    for name in rows {
        columns.push(name?);
    }
    Ok(columns)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, CoreError> {
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}
