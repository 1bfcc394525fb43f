use std::collections::{BTreeSet, HashMap};

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreError;
use crate::extractor::{detect_extension, image_file_name, SIGNATURE_PROBE_LEN};
use crate::models::{ContentItem, ConversationKind, GroupMembership, ImageRef, MessageRecord, Sender};
use crate::scanner::RawRow;
use crate::schema::{
    CONTENT_TABLE, CONTENT_URI_TABLE, IMAGE_TABLE, MESSAGE_KEY, RETAIN_COUNT_COLUMNS,
    RETAIN_COUNT_TABLE,
};
use crate::source::{column_exists, table_exists};
use crate::timestamps::Timestamp;

pub const GROUP_JID_SUFFIX: &str = "@groups.kik.com";
pub const PREVIEW_CONTENT_NAME: &str = "preview";

/// group id → member ids. Built once per run and only read afterwards.
#[derive(Debug, Default, Clone)]
pub struct MembershipIndex {
    groups: HashMap<String, BTreeSet<String>>,
}

impl MembershipIndex {
    pub fn insert(&mut self, membership: GroupMembership) {
        self.groups
            .entry(membership.group_id)
            .or_default()
            .insert(membership.member_jid);
    }

    pub fn contains_group(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn participants(&self, group_id: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(group_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn member_count(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }
}

pub fn membership_from_row(row: &RawRow) -> Result<GroupMembership, CoreError> {
    let group_id = row
        .identifier("group_id")?
        .ok_or_else(|| row.integrity("group_id is null".to_string()))?;
    let member_jid = row
        .identifier("member_jid")?
        .ok_or_else(|| row.integrity("member_jid is null".to_string()))?;
    Ok(GroupMembership {
        group_id,
        member_jid,
    })
}

pub struct RecordNormalizer<'a> {
    membership: &'a MembershipIndex,
}

impl<'a> RecordNormalizer<'a> {
    pub fn new(membership: &'a MembershipIndex) -> Self {
        Self { membership }
    }

    pub fn classify(&self, row: &RawRow) -> Result<ConversationKind, CoreError> {
        let conversation_id = conversation_id(row)?;
        Ok(self.kind_of(&conversation_id))
    }

    pub fn normalize_message(&self, row: &RawRow) -> Result<MessageRecord, CoreError> {
        let message_id = row
            .identifier(MESSAGE_KEY)?
            .ok_or_else(|| row.integrity("message id is null".to_string()))?;
        let conversation_id = conversation_id(row)?;
        let sender = resolve_sender(row)?;
        let partner_jid = row.identifier("partner_jid")?;
        let body = row.text("body")?.unwrap_or_default();
        let timestamp = Timestamp::from_raw(row.integer("timestamp")?);
        let content_id = row.identifier("content_id")?;
        let status_message = optional_identifier(row, "stat_msg")?;
        let status_user_jid = optional_identifier(row, "stat_user_jid")?;
        let friend_attr_id = optional_identifier(row, "friend_attr_id")?;

        let conversation_kind = self.kind_of(&conversation_id);
        let participants = match conversation_kind {
            ConversationKind::Group => self
                .membership
                .participants(&conversation_id)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default(),
            ConversationKind::Private => Vec::new(),
        };

        Ok(MessageRecord {
            message_id,
            conversation_id,
            sender,
            partner_jid,
            body,
            timestamp,
            conversation_kind,
            participants,
            content_id,
            status_message,
            status_user_jid,
            friend_attr_id,
        })
    }

    fn kind_of(&self, conversation_id: &str) -> ConversationKind {
        if conversation_id.ends_with(GROUP_JID_SUFFIX) || self.membership.contains_group(conversation_id) {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        }
    }
}

fn conversation_id(row: &RawRow) -> Result<String, CoreError> {
    row.identifier("bin_id")?
        .ok_or_else(|| row.integrity("conversation id bin_id is null".to_string()))
}

/// Columns outside the required contract are only in the row when the backup has them.
fn optional_identifier(row: &RawRow, column: &str) -> Result<Option<String>, CoreError> {
    if !row.has_column(column) {
        return Ok(None);
    }
    row.identifier(column)
}

/// Never defaults: a flag outside {0, 1} would otherwise invent who said what.
fn resolve_sender(row: &RawRow) -> Result<Sender, CoreError> {
    match row.integer("was_me")? {
        None => Err(row.integrity("ownership flag was_me is null".to_string())),
        Some(flag) => Sender::from_flag(flag).ok_or_else(|| {
            row.integrity(format!("ownership flag was_me = {flag} is neither 0 nor 1"))
        }),
    }
}

/// Point lookups for the content join. Nothing here reads a whole table or a whole payload.
pub struct ContentResolver<'conn> {
    conn: &'conn Connection,
    has_retain_counts: bool,
}

impl<'conn> ContentResolver<'conn> {
    pub fn new(conn: &'conn Connection) -> Result<Self, CoreError> {
        let has_retain_counts = table_exists(conn, RETAIN_COUNT_TABLE)?
            && RETAIN_COUNT_COLUMNS
                .iter()
                .map(|column| column_exists(conn, RETAIN_COUNT_TABLE, column))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .all(|present| present);
        Ok(Self {
            conn,
            has_retain_counts,
        })
    }

    pub fn resolve(&self, record: &MessageRecord) -> Result<Option<ContentItem>, CoreError> {
        let content_id = match record.content_id.as_deref() {
            Some(content_id) => content_id,
            None => return Ok(None),
        };

        let (content_names, preview) = self.attributes(content_id)?;
        let content_uri = self.uri(content_id)?;
        let retain_count = self.retain_count(content_id)?;
        let image_id = preview.unwrap_or_else(|| content_id.to_string());
        let image = self.image_ref(&image_id)?;

        Ok(Some(ContentItem {
            message_id: record.message_id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender: record.sender,
            timestamp: record.timestamp,
            content_id: content_id.to_string(),
            content_names,
            content_uri,
            image_id,
            image,
            retain_count,
        }))
    }

    fn attributes(&self, content_id: &str) -> Result<(Vec<String>, Option<String>), CoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT content_name, content_string FROM {CONTENT_TABLE} WHERE content_id = ?1 ORDER BY rowid;"
        ))?;
        let mut rows = stmt.query(params![content_id])?;
        let mut names: Vec<String> = Vec::new();
        let mut preview = None;
        while let Some(row) = rows.next()? {
            let name = value_text(row.get::<_, Value>(0)?);
            let string = value_text(row.get::<_, Value>(1)?);
            if let Some(name) = name {
                if name == PREVIEW_CONTENT_NAME && preview.is_none() {
                    preview = string;
                }
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok((names, preview))
    }

    fn uri(&self, content_id: &str) -> Result<Option<String>, CoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT content_uri FROM {CONTENT_URI_TABLE} \
             WHERE content_id = ?1 AND content_uri IS NOT NULL ORDER BY rowid LIMIT 1;"
        ))?;
        let uri: Option<Value> = stmt
            .query_row(params![content_id], |row| row.get(0))
            .optional()?;
        Ok(uri.and_then(value_text))
    }

    fn retain_count(&self, content_id: &str) -> Result<Option<i64>, CoreError> {
        if !self.has_retain_counts {
            return Ok(None);
        }
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT retain_count FROM {RETAIN_COUNT_TABLE} WHERE content_id = ?1 ORDER BY rowid LIMIT 1;"
        ))?;
        let count: Option<Value> = stmt
            .query_row(params![content_id], |row| row.get(0))
            .optional()?;
        Ok(match count {
            Some(Value::Integer(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads only the signature prefix, enough to name the file the extractor will write.
    fn image_ref(&self, image_id: &str) -> Result<ImageRef, CoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT substr(image_bytes, 1, {SIGNATURE_PROBE_LEN}), length(image_bytes) \
             FROM {IMAGE_TABLE} WHERE image_id = ?1 LIMIT 1;"
        ))?;
        let found: Option<(Value, Option<i64>)> = stmt
            .query_row(params![image_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let header = match found {
            Some((Value::Blob(bytes), Some(len))) if len > 0 => bytes,
            Some((Value::Text(text), Some(len))) if len > 0 => text.into_bytes(),
            _ => return Ok(ImageRef::NoImageData),
        };
        Ok(ImageRef::File(image_file_name(image_id, detect_extension(&header))))
    }
}

fn value_text(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        Value::Integer(v) => Some(v.to_string()),
        Value::Real(v) => Some(v.to_string()),
        Value::Null | Value::Blob(_) => None,
    }
}
