//! Key-paginated, memory-bounded table scanning.
//!
//! A [`TableScanner`] holds at most one chunk of rows. Each fetch asks for the
//! next `chunk_size` rows whose key is strictly greater than the last key
//! handed out, so the sequence can be restarted from any observed key with
//! [`TableScanner::resume_after`] and chunk size never changes what is yielded.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use rusqlite::types::{ToSql, ToSqlOutput, Value};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::CoreError;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_BLOB_CHUNK_SIZE: usize = 100;

/// Cursor position: the key column value of a yielded row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey(Value);

impl From<i64> for ScanKey {
    fn from(value: i64) -> Self {
        ScanKey(Value::Integer(value))
    }
}

impl From<&str> for ScanKey {
    fn from(value: &str) -> Self {
        ScanKey(Value::Text(value.to_string()))
    }
}

impl From<Value> for ScanKey {
    fn from(value: Value) -> Self {
        ScanKey(value)
    }
}

impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "x'{}'", hex::encode(v)),
        }
    }
}

impl ToSql for ScanKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<String>,
    pub chunk_size: usize,
}

impl ScanSpec {
    pub fn new(table: &str, key_column: &str, columns: &[&str], chunk_size: usize) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            chunk_size,
        }
    }
}

/// One untyped row. Typed accessors turn a missing column or a value of the
/// wrong storage class into `FieldIntegrity`.
#[derive(Debug, Clone)]
pub struct RawRow {
    table: Rc<str>,
    key: ScanKey,
    columns: Rc<[String]>,
    values: Vec<Value>,
}

impl RawRow {
    pub fn from_values(table: &str, key: impl Into<ScanKey>, values: Vec<(&str, Value)>) -> Self {
        let (columns, values): (Vec<String>, Vec<Value>) = values
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .unzip();
        Self {
            table: Rc::from(table),
            key: key.into(),
            columns: Rc::from(columns),
            values,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &ScanKey {
        &self.key
    }

    pub fn row_id(&self) -> String {
        self.key.to_string()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|name| name == column)
    }

    pub fn value(&self, column: &str) -> Result<&Value, CoreError> {
        self.position(column).map(|idx| &self.values[idx])
    }

    pub fn integer(&self, column: &str) -> Result<Option<i64>, CoreError> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            other => Err(self.integrity(format!(
                "column {column} holds {} where an integer was expected",
                storage_class(other)
            ))),
        }
    }

    pub fn text(&self, column: &str) -> Result<Option<String>, CoreError> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            other => Err(self.integrity(format!(
                "column {column} holds {} where text was expected",
                storage_class(other)
            ))),
        }
    }

    /// Identifiers are stored as text or integers depending on the client version.
    pub fn identifier(&self, column: &str) -> Result<Option<String>, CoreError> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Text(v) if v.is_empty() => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            Value::Integer(v) => Ok(Some(v.to_string())),
            other => Err(self.integrity(format!(
                "column {column} holds {} where an identifier was expected",
                storage_class(other)
            ))),
        }
    }

    /// Moves the payload out of the row instead of copying it.
    pub fn take_blob(&mut self, column: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let idx = self.position(column)?;
        match std::mem::replace(&mut self.values[idx], Value::Null) {
            Value::Null => Ok(None),
            Value::Blob(bytes) => Ok(Some(bytes)),
            other => {
                let class = storage_class(&other);
                self.values[idx] = other;
                Err(self.integrity(format!(
                    "column {column} holds {class} where a blob was expected"
                )))
            }
        }
    }

    pub(crate) fn integrity(&self, detail: String) -> CoreError {
        CoreError::FieldIntegrity {
            table: self.table.to_string(),
            row: self.row_id(),
            detail,
        }
    }

    fn position(&self, column: &str) -> Result<usize, CoreError> {
        self.columns
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| self.integrity(format!("column {column} missing from row")))
    }
}

fn storage_class(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Integer(_) => "an integer",
        Value::Real(_) => "a real",
        Value::Text(_) => "text",
        Value::Blob(_) => "a blob",
    }
}

pub struct TableScanner<'conn> {
    conn: &'conn Connection,
    spec: ScanSpec,
    table: Rc<str>,
    columns: Rc<[String]>,
    sql_first: String,
    sql_after: String,
    cursor: Option<ScanKey>,
    buffer: VecDeque<RawRow>,
    exhausted: bool,
    chunks_fetched: u64,
}

impl<'conn> TableScanner<'conn> {
    pub fn open(conn: &'conn Connection, spec: &ScanSpec) -> Result<Self, CoreError> {
        if spec.chunk_size == 0 {
            return Err(CoreError::InvalidArgument(
                "chunk size must be positive".to_string(),
            ));
        }
        check_identifier(&spec.table)?;
        check_identifier(&spec.key_column)?;
        for column in &spec.columns {
            check_identifier(column)?;
        }

        let mut columns = Vec::with_capacity(spec.columns.len() + 1);
        columns.push(spec.key_column.clone());
        columns.extend(spec.columns.iter().cloned());
        let projection = columns.join(", ");
        let sql_first = format!(
            "SELECT {projection} FROM {table} WHERE {key} IS NOT NULL ORDER BY {key} LIMIT ?1;",
            table = spec.table,
            key = spec.key_column,
        );
        let sql_after = format!(
            "SELECT {projection} FROM {table} WHERE {key} > ?1 ORDER BY {key} LIMIT ?2;",
            table = spec.table,
            key = spec.key_column,
        );

        Ok(Self {
            conn,
            spec: spec.clone(),
            table: Rc::from(spec.table.as_str()),
            columns: Rc::from(columns),
            sql_first,
            sql_after,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            chunks_fetched: 0,
        })
    }

    /// Restarts the sequence just after `key`; `None` starts from the beginning.
    pub fn resume_after(mut self, key: Option<ScanKey>) -> Self {
        self.cursor = key;
        self.buffer.clear();
        self.exhausted = false;
        self
    }

    pub fn last_key(&self) -> Option<&ScanKey> {
        self.cursor.as_ref()
    }

    pub fn chunks_fetched(&self) -> u64 {
        self.chunks_fetched
    }

    /// Rows whose key is NULL can never be reached by key pagination.
    pub fn unkeyed_rows(&self) -> Result<i64, CoreError> {
        let sql = format!(
            "SELECT COUNT(1) FROM {table} WHERE {key} IS NULL;",
            table = self.spec.table,
            key = self.spec.key_column,
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn fetch_chunk(&mut self) -> rusqlite::Result<()> {
        let limit = self.spec.chunk_size as i64;
        let width = self.columns.len();
        let fetched = match &self.cursor {
            Some(key) => {
                let mut stmt = self.conn.prepare_cached(&self.sql_after)?;
                let rows = stmt.query(params![key, limit])?;
                read_rows(rows, width)?
            }
            None => {
                let mut stmt = self.conn.prepare_cached(&self.sql_first)?;
                let rows = stmt.query(params![limit])?;
                read_rows(rows, width)?
            }
        };
        self.chunks_fetched += 1;
        let count = fetched.len();
        debug!(
            table = %self.table,
            after = ?self.cursor.as_ref().map(ToString::to_string),
            rows = count,
            "fetched chunk"
        );
        if count < self.spec.chunk_size {
            self.exhausted = true;
        }
        for values in fetched {
            let key = ScanKey(values[0].clone());
            self.buffer.push_back(RawRow {
                table: Rc::clone(&self.table),
                key,
                columns: Rc::clone(&self.columns),
                values,
            });
        }
        Ok(())
    }
}

impl Iterator for TableScanner<'_> {
    type Item = Result<RawRow, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(source) = self.fetch_chunk() {
                self.exhausted = true;
                return Some(Err(CoreError::ScanInterrupted {
                    table: self.spec.table.clone(),
                    last_key: self.cursor.clone(),
                    source,
                }));
            }
        }
        let row = self.buffer.pop_front()?;
        self.cursor = Some(row.key.clone());
        Some(Ok(row))
    }
}

fn read_rows(mut rows: rusqlite::Rows<'_>, width: usize) -> rusqlite::Result<Vec<Vec<Value>>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(row.get::<_, Value>(idx)?);
        }
        out.push(values);
    }
    Ok(out)
}

fn check_identifier(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoreError::InvalidArgument(format!(
            "invalid table or column name: {name:?}"
        )));
    }
    Ok(())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64, CoreError> {
    check_identifier(table)?;
    Ok(conn.query_row(&format!("SELECT COUNT(1) FROM {table};"), [], |row| row.get(0))?)
}
