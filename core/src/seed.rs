//! Demo backup builder for tests and manual runs. The layout mirrors a real
//! `kikDatabase.db`: one private conversation, one group, a few content items.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::CoreError;
use crate::schema::SOURCE_DDL;

pub const DEMO_PRIVATE_JID: &str = "alice_k3p@talk.kik.com";
pub const DEMO_GROUP_JID: &str = "1100_team@groups.kik.com";
pub const DEMO_MEMBERS: &[&str] = &["alice_k3p@talk.kik.com", "bob_r7q@talk.kik.com"];

pub const JPEG_SAMPLE: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0xFF, 0xD9];
pub const PNG_SAMPLE: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
];
pub const UNKNOWN_SAMPLE: &[u8] = &[0x00, 0x01, 0x02, 0x03];

/// Messages carrying content: a previewed JPEG (private), a PNG keyed by its content
/// id (group) and one whose preview has no payload (private).
pub const DEMO_CONTENT_MESSAGES: i64 = 3;

pub fn create_source_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SOURCE_DDL)?;
    Ok(())
}

/// Creates a new backup file at `path` holding the demo data.
pub fn write_demo_backup(path: &Path, private_count: i64, group_count: i64) -> Result<(), CoreError> {
    let conn = Connection::open(path)?;
    create_source_schema(&conn)?;
    seed_demo_backup(&conn, private_count, group_count)
}

pub fn seed_demo_backup(conn: &Connection, private_count: i64, group_count: i64) -> Result<(), CoreError> {
    conn.execute_batch("BEGIN;")?;
    let result = (|| -> Result<(), CoreError> {
        let base_ts = 1_700_000_000_000i64;
        let mut msg_stmt = conn.prepare(
            "INSERT INTO messagesTable (_id, bin_id, partner_jid, was_me, body, timestamp, content_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
        )?;
        let mut member_stmt =
            conn.prepare("INSERT INTO memberTable (group_id, member_jid, is_admin) VALUES (?1, ?2, ?3);")?;
        let mut content_stmt = conn.prepare(
            "INSERT INTO KIKContentTable (content_id, content_name, content_string) VALUES (?1, ?2, ?3);",
        )?;
        let mut image_stmt = conn
            .prepare("INSERT INTO AccountSwitcherImgBackupTable (image_id, image_bytes) VALUES (?1, ?2);")?;

        for (idx, member) in DEMO_MEMBERS.iter().enumerate() {
            member_stmt.execute(params![DEMO_GROUP_JID, member, (idx == 0) as i64])?;
        }

        let mut next_id = 1i64;
        for idx in 0..private_count {
            let was_me = (idx % 2 == 0) as i64;
            let body = if was_me == 1 {
                format!("Demo message {}", idx + 1)
            } else {
                format!("Reply {}", idx + 1)
            };
            msg_stmt.execute(params![
                next_id,
                DEMO_PRIVATE_JID,
                DEMO_PRIVATE_JID,
                was_me,
                body,
                base_ts + idx * 60_000,
                Option::<String>::None,
            ])?;
            next_id += 1;
        }

        for idx in 0..group_count {
            let was_me = (idx % 3 == 0) as i64;
            let partner = DEMO_MEMBERS[idx as usize % DEMO_MEMBERS.len()];
            msg_stmt.execute(params![
                next_id,
                DEMO_GROUP_JID,
                partner,
                was_me,
                format!("Group message {}", idx + 1),
                base_ts + 3_600_000 + idx * 60_000,
                Option::<String>::None,
            ])?;
            next_id += 1;
        }

        let content_ts = base_ts + 7_200_000;
        msg_stmt.execute(params![
            next_id,
            DEMO_PRIVATE_JID,
            DEMO_PRIVATE_JID,
            1i64,
            Option::<String>::None,
            content_ts,
            "c-jpeg",
        ])?;
        msg_stmt.execute(params![
            next_id + 1,
            DEMO_GROUP_JID,
            DEMO_MEMBERS[1],
            0i64,
            "look at this",
            content_ts + 60_000,
            "c-png",
        ])?;
        msg_stmt.execute(params![
            next_id + 2,
            DEMO_PRIVATE_JID,
            DEMO_PRIVATE_JID,
            0i64,
            Option::<String>::None,
            content_ts + 120_000,
            "c-missing",
        ])?;

        content_stmt.execute(params!["c-jpeg", "preview", "img-jpeg"])?;
        content_stmt.execute(params!["c-jpeg", "file-name", "beach.jpg"])?;
        content_stmt.execute(params!["c-png", "file-name", "chart.png"])?;
        content_stmt.execute(params!["c-missing", "preview", "img-missing"])?;
        conn.execute(
            "INSERT INTO KIKContentURITable (content_id, content_uri) VALUES (?1, ?2);",
            params!["c-jpeg", "content://com.kik.android/c-jpeg"],
        )?;
        conn.execute(
            "INSERT INTO KIKContentRetainCountTable (content_id, retain_count) VALUES (?1, ?2);",
            params!["c-jpeg", 1i64],
        )?;

        image_stmt.execute(params!["img-jpeg", JPEG_SAMPLE])?;
        image_stmt.execute(params!["c-png", PNG_SAMPLE])?;
        image_stmt.execute(params!["img-unknown", UNKNOWN_SAMPLE])?;
        image_stmt.execute(params!["img-empty", Vec::<u8>::new()])?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")?;
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}
