//! Tabular output. Rows are projected from normalized records and handed to a
//! [`SheetWriter`] one at a time, sheet after sheet, in a fixed order.

use crate::error::CoreError;
use crate::models::{ContentItem, ImageRef, MessageRecord};

#[path = "export/html.rs"]
mod html;
#[path = "export/xlsx.rs"]
mod xlsx;

pub use html::{write_report_index, HtmlSheetWriter, ReportIndexEntry};
pub use xlsx::{truncate_cell, XlsxSheetWriter, MAX_CELL_CHARS, TRUNCATION_MARKER};

pub const PRIVATE_SHEET: &str = "Private Messages";
pub const GROUP_SHEET: &str = "Group Messages";
pub const IMAGES_SHEET: &str = "Images";

pub const MESSAGE_SHEET_COLUMNS: &[&str] = &[
    "message_id",
    "conversation_id",
    "conversation_kind",
    "sender",
    "partner_jid",
    "timestamp",
    "body",
    "content_id",
    "participants",
    "stat_msg",
    "stat_user_jid",
    "friend_attr_id",
];

pub const CONTENT_SHEET_COLUMNS: &[&str] = &[
    "message_id",
    "conversation_id",
    "sender",
    "timestamp",
    "content_id",
    "content_names",
    "content_uri",
    "image_id",
    "image_file",
    "retain_count",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Text(String),
    Integer(i64),
    /// Name of an extracted image file, relative to the image directory.
    File(String),
}

impl Cell {
    fn text_or_empty(value: Option<&str>) -> Cell {
        match value {
            Some(value) => Cell::Text(value.to_string()),
            None => Cell::Empty,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(value) | Cell::File(value) => Some(value),
            _ => None,
        }
    }
}

pub trait SheetWriter {
    type Output;

    /// Starts a new sheet; the previous one, if any, is complete.
    fn begin_sheet(&mut self, name: &str, columns: &[&str]) -> Result<(), CoreError>;

    fn write_row(&mut self, row: &[Cell]) -> Result<(), CoreError>;

    /// Longest text a cell keeps intact. Writers with a limit cut longer text themselves;
    /// callers use this to account for what was cut.
    fn max_cell_chars(&self) -> Option<usize> {
        None
    }

    /// Makes the output visible. Nothing is visible before this succeeds.
    fn finish(self) -> Result<Self::Output, CoreError>;
}

/// Feeds every sheet to both writers. The second output is only made visible after the first.
impl<A, B> SheetWriter for (A, B)
where
    A: SheetWriter,
    B: SheetWriter,
{
    type Output = (A::Output, B::Output);

    fn begin_sheet(&mut self, name: &str, columns: &[&str]) -> Result<(), CoreError> {
        self.0.begin_sheet(name, columns)?;
        self.1.begin_sheet(name, columns)
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), CoreError> {
        self.0.write_row(row)?;
        self.1.write_row(row)
    }

    fn max_cell_chars(&self) -> Option<usize> {
        match (self.0.max_cell_chars(), self.1.max_cell_chars()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn finish(self) -> Result<Self::Output, CoreError> {
        let first = self.0.finish()?;
        let second = self.1.finish()?;
        Ok((first, second))
    }
}

pub fn message_row(record: &MessageRecord) -> Vec<Cell> {
    vec![
        Cell::Text(record.message_id.clone()),
        Cell::Text(record.conversation_id.clone()),
        Cell::Text(record.conversation_kind.as_str().to_string()),
        Cell::Text(record.sender.as_str().to_string()),
        Cell::text_or_empty(record.partner_jid.as_deref()),
        Cell::Text(record.timestamp.to_string()),
        Cell::Text(record.body.clone()),
        Cell::text_or_empty(record.content_id.as_deref()),
        if record.participants.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(record.participants.join(", "))
        },
        Cell::text_or_empty(record.status_message.as_deref()),
        Cell::text_or_empty(record.status_user_jid.as_deref()),
        Cell::text_or_empty(record.friend_attr_id.as_deref()),
    ]
}

pub fn content_row(item: &ContentItem) -> Vec<Cell> {
    vec![
        Cell::Text(item.message_id.clone()),
        Cell::Text(item.conversation_id.clone()),
        Cell::Text(item.sender.as_str().to_string()),
        Cell::Text(item.timestamp.to_string()),
        Cell::Text(item.content_id.clone()),
        if item.content_names.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(item.content_names.join(", "))
        },
        Cell::text_or_empty(item.content_uri.as_deref()),
        Cell::Text(item.image_id.clone()),
        match &item.image {
            ImageRef::File(name) => Cell::File(name.clone()),
            ImageRef::NoImageData => Cell::Text(item.image.to_string()),
        },
        match item.retain_count {
            Some(count) => Cell::Integer(count),
            None => Cell::Empty,
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Collects sheets in memory. Used by tests and by callers that post-process rows.
#[derive(Debug, Default)]
pub struct MemorySheetWriter {
    sheets: Vec<MemorySheet>,
}

impl MemorySheetWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SheetWriter for MemorySheetWriter {
    type Output = Vec<MemorySheet>;

    fn begin_sheet(&mut self, name: &str, columns: &[&str]) -> Result<(), CoreError> {
        self.sheets.push(MemorySheet {
            name: name.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: Vec::new(),
        });
        Ok(())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), CoreError> {
        let sheet = self
            .sheets
            .last_mut()
            .ok_or_else(|| CoreError::ExportWrite("row written before any sheet".to_string()))?;
        if row.len() != sheet.columns.len() {
            return Err(CoreError::ExportWrite(format!(
                "sheet {} expects {} cells, got {}",
                sheet.name,
                sheet.columns.len(),
                row.len()
            )));
        }
        sheet.rows.push(row.to_vec());
        Ok(())
    }

    fn finish(self) -> Result<Self::Output, CoreError> {
        Ok(self.sheets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationKind, Sender};
    use crate::timestamps::Timestamp;

    #[test]
    fn message_projection_matches_columns() {
        let record = MessageRecord {
            message_id: "1".to_string(),
            conversation_id: "42".to_string(),
            sender: Sender::Owner,
            partner_jid: None,
            body: "hi".to_string(),
            timestamp: Timestamp::from_raw(Some(1_700_000_000)),
            conversation_kind: ConversationKind::Private,
            participants: Vec::new(),
            content_id: None,
            status_message: Some("alice has left the chat".to_string()),
            status_user_jid: None,
            friend_attr_id: None,
        };
        let row = message_row(&record);
        assert_eq!(row.len(), MESSAGE_SHEET_COLUMNS.len());
        assert_eq!(row[3], Cell::Text("OWNER".to_string()));
        assert_eq!(row[5], Cell::Text("2023-11-14T22:13:20Z".to_string()));
        assert_eq!(row[4], Cell::Empty);
        assert_eq!(row[9], Cell::Text("alice has left the chat".to_string()));
        assert_eq!(row[10], Cell::Empty);
    }

    #[test]
    fn content_projection_reports_missing_images() {
        let item = ContentItem {
            message_id: "7".to_string(),
            conversation_id: "42".to_string(),
            sender: Sender::Other,
            timestamp: Timestamp::Unknown,
            content_id: "c-7".to_string(),
            content_names: vec!["preview".to_string(), "file-name".to_string()],
            content_uri: None,
            image_id: "c-7".to_string(),
            image: ImageRef::NoImageData,
            retain_count: Some(2),
        };
        let row = content_row(&item);
        assert_eq!(row.len(), CONTENT_SHEET_COLUMNS.len());
        assert_eq!(row[8], Cell::Text("no image data".to_string()));
        assert_eq!(row[5], Cell::Text("preview, file-name".to_string()));
        assert_eq!(row[9], Cell::Integer(2));

        let found = ContentItem {
            image: ImageRef::File("img-7.jpg".to_string()),
            ..item
        };
        assert_eq!(content_row(&found)[8], Cell::File("img-7.jpg".to_string()));
    }

    #[test]
    fn paired_writers_see_the_same_rows() {
        let mut pair = (MemorySheetWriter::new(), MemorySheetWriter::new());
        assert_eq!(pair.max_cell_chars(), None);
        pair.begin_sheet(IMAGES_SHEET, &["a"]).expect("sheet");
        pair.write_row(&[Cell::File("x.png".to_string())]).expect("row");
        let (left, right) = pair.finish().expect("finish");
        assert_eq!(left, right);
        assert_eq!(left[0].rows[0][0].as_text(), Some("x.png"));
    }

    #[test]
    fn memory_writer_rejects_ragged_rows() {
        let mut writer = MemorySheetWriter::new();
        assert!(writer.write_row(&[Cell::Empty]).is_err());
        writer.begin_sheet(IMAGES_SHEET, &["a", "b"]).expect("sheet");
        assert!(writer.write_row(&[Cell::Empty]).is_err());
        writer.write_row(&[Cell::Empty, Cell::Integer(1)]).expect("row");
        let sheets = writer.finish().expect("finish");
        assert_eq!(sheets[0].rows.len(), 1);
    }
}
