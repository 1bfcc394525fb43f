//! Source schema contract for Kik backups and the validator that gates every run.

use rusqlite::Connection;
use tracing::debug;

use crate::error::CoreError;
use crate::source::{table_columns, table_exists};

pub const MESSAGES_TABLE: &str = "messagesTable";
pub const MEMBERS_TABLE: &str = "memberTable";
pub const CONTENT_TABLE: &str = "KIKContentTable";
pub const CONTENT_URI_TABLE: &str = "KIKContentURITable";
pub const RETAIN_COUNT_TABLE: &str = "KIKContentRetainCountTable";
pub const IMAGE_TABLE: &str = "AccountSwitcherImgBackupTable";

pub const MESSAGE_KEY: &str = "_id";
pub const MESSAGE_COLUMNS: &[&str] = &[
    "bin_id",
    "partner_jid",
    "was_me",
    "body",
    "timestamp",
    "content_id",
];
/// Status and attribution columns. Not every client version has them, so they are
/// probed per run and read only when present.
pub const OPTIONAL_MESSAGE_COLUMNS: &[&str] = &["stat_msg", "stat_user_jid", "friend_attr_id"];
pub const MEMBER_COLUMNS: &[&str] = &["group_id", "member_jid"];
pub const CONTENT_COLUMNS: &[&str] = &["content_id", "content_name", "content_string"];
pub const CONTENT_URI_COLUMNS: &[&str] = &["content_id", "content_uri"];
pub const RETAIN_COUNT_COLUMNS: &[&str] = &["content_id", "retain_count"];
pub const IMAGE_KEY: &str = "image_id";
pub const IMAGE_COLUMNS: &[&str] = &["image_id", "image_bytes"];

#[derive(Debug, Clone, Copy)]
pub struct TableRequirement {
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

const MESSAGE_REQUIREMENT_COLUMNS: &[&str] = &[
    "_id",
    "bin_id",
    "partner_jid",
    "was_me",
    "body",
    "timestamp",
    "content_id",
];

/// Everything the workbook export reads. The retain-count table is optional and probed separately.
pub const EXPORT_REQUIREMENTS: &[TableRequirement] = &[
    TableRequirement {
        table: MESSAGES_TABLE,
        columns: MESSAGE_REQUIREMENT_COLUMNS,
    },
    TableRequirement {
        table: MEMBERS_TABLE,
        columns: MEMBER_COLUMNS,
    },
    TableRequirement {
        table: CONTENT_TABLE,
        columns: CONTENT_COLUMNS,
    },
    TableRequirement {
        table: CONTENT_URI_TABLE,
        columns: CONTENT_URI_COLUMNS,
    },
    TableRequirement {
        table: IMAGE_TABLE,
        columns: IMAGE_COLUMNS,
    },
];

pub const IMAGE_REQUIREMENTS: &[TableRequirement] = &[TableRequirement {
    table: IMAGE_TABLE,
    columns: IMAGE_COLUMNS,
}];

/// Fails with `SchemaMismatch` naming the first missing table or column, in requirement order.
pub fn validate_schema(conn: &Connection, requirements: &[TableRequirement]) -> Result<(), CoreError> {
    for requirement in requirements {
        if !table_exists(conn, requirement.table)? {
            return Err(CoreError::SchemaMismatch {
                table: requirement.table.to_string(),
                column: None,
            });
        }
        let present = table_columns(conn, requirement.table)?;
        debug!(table = requirement.table, columns = ?present, "schema probe");
        for column in requirement.columns {
            if !present.iter().any(|name| name == column) {
                return Err(CoreError::SchemaMismatch {
                    table: requirement.table.to_string(),
                    column: Some((*column).to_string()),
                });
            }
        }
    }
    Ok(())
}

/// DDL matching the contract above, used to build fixture backups.
pub const SOURCE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS messagesTable (
  _id INTEGER PRIMARY KEY,
  bin_id TEXT,
  partner_jid TEXT,
  was_me INTEGER,
  body TEXT,
  timestamp INTEGER,
  content_id TEXT,
  stat_msg TEXT,
  stat_user_jid TEXT,
  friend_attr_id TEXT
);

CREATE TABLE IF NOT EXISTS memberTable (
  group_id TEXT,
  member_jid TEXT,
  is_admin INTEGER
);

CREATE TABLE IF NOT EXISTS KIKContentTable (
  content_id TEXT,
  content_name TEXT,
  content_string TEXT
);

CREATE TABLE IF NOT EXISTS KIKContentURITable (
  content_id TEXT,
  content_uri TEXT
);

CREATE TABLE IF NOT EXISTS KIKContentRetainCountTable (
  content_id TEXT,
  retain_count INTEGER
);

CREATE TABLE IF NOT EXISTS AccountSwitcherImgBackupTable (
  image_id TEXT PRIMARY KEY,
  image_bytes BLOB
);
"#;
