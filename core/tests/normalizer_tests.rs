use blue_kik_core::context::RunContext;
use blue_kik_core::diagnostics::{DiagnosticKind, MemorySink};
use blue_kik_core::export::{Cell, MemorySheet, MemorySheetWriter, GROUP_SHEET, IMAGES_SHEET, PRIVATE_SHEET};
use blue_kik_core::pipeline::{export_messages, ExtractConfig};
use blue_kik_core::schema::SOURCE_DDL;
use blue_kik_core::seed::{create_source_schema, seed_demo_backup, DEMO_GROUP_JID, JPEG_SAMPLE};
use rusqlite::{params, Connection};

fn empty_backup() -> Connection {
    let conn = Connection::open_in_memory().expect("memory db");
    create_source_schema(&conn).expect("schema");
    conn
}

fn insert_message(
    conn: &Connection,
    id: i64,
    bin_id: &str,
    was_me: Option<i64>,
    body: Option<&str>,
    timestamp: Option<i64>,
    content_id: Option<&str>,
) {
    conn.execute(
        "INSERT INTO messagesTable (_id, bin_id, partner_jid, was_me, body, timestamp, content_id) \
         VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6);",
        params![id, bin_id, was_me, body, timestamp, content_id],
    )
    .expect("insert message");
}

fn export(conn: &Connection, config: &ExtractConfig, ctx: &mut RunContext) -> Vec<MemorySheet> {
    export_messages(conn, config, ctx, MemorySheetWriter::new(), &|_: &str| {}).expect("export")
}

fn text(cell: &Cell) -> &str {
    cell.as_text().unwrap_or("")
}

fn column(sheet: &MemorySheet, name: &str) -> usize {
    sheet
        .columns
        .iter()
        .position(|c| c == name)
        .unwrap_or_else(|| panic!("no column {name}"))
}

#[test]
fn owner_message_scenario() {
    let conn = empty_backup();
    insert_message(&conn, 1, "42", Some(1), Some("hi"), Some(1_700_000_000), None);

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let names: Vec<&str> = sheets.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![PRIVATE_SHEET, GROUP_SHEET, IMAGES_SHEET]);

    let private = &sheets[0];
    assert_eq!(private.rows.len(), 1);
    let row = &private.rows[0];
    assert_eq!(text(&row[column(private, "message_id")]), "1");
    assert_eq!(text(&row[column(private, "sender")]), "OWNER");
    assert_eq!(text(&row[column(private, "conversation_kind")]), "PRIVATE");
    assert_eq!(text(&row[column(private, "timestamp")]), "2023-11-14T22:13:20Z");
    assert_eq!(text(&row[column(private, "body")]), "hi");
    assert!(sheets[1].rows.is_empty());
    assert!(sheets[2].rows.is_empty());
}

#[test]
fn invalid_ownership_flags_are_skipped_and_recorded() {
    let conn = empty_backup();
    insert_message(&conn, 1, "42", Some(1), Some("a"), Some(1), None);
    insert_message(&conn, 2, "42", Some(2), Some("b"), Some(2), None);
    insert_message(&conn, 3, "42", None, Some("c"), Some(3), None);
    insert_message(&conn, 4, "42", Some(0), None, None, None);
    insert_message(&conn, 5, "9@groups.kik.com", Some(-1), Some("d"), Some(5), None);

    let sink = MemorySink::new();
    let mut ctx = RunContext::new(Box::new(sink.clone()));
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);

    let private = &sheets[0];
    let senders: Vec<&str> = private
        .rows
        .iter()
        .map(|row| text(&row[column(private, "sender")]))
        .collect();
    assert_eq!(senders, vec!["OWNER", "OTHER"]);
    let last = &private.rows[1];
    assert_eq!(text(&last[column(private, "body")]), "");
    assert_eq!(text(&last[column(private, "timestamp")]), "unknown");
    assert!(sheets[1].rows.is_empty());

    assert_eq!(ctx.stats().private_messages.skipped, 2);
    assert_eq!(ctx.stats().group_messages.skipped, 1);
    let mut rows: Vec<String> = sink
        .events()
        .iter()
        .filter(|event| event.kind == DiagnosticKind::FieldIntegrity)
        .filter_map(|event| event.row.clone())
        .collect();
    rows.sort();
    assert_eq!(rows, vec!["2", "3", "5"]);
}

#[test]
fn group_rows_carry_membership() {
    let conn = empty_backup();
    conn.execute_batch(
        "INSERT INTO memberTable (group_id, member_jid) VALUES
           ('g1@groups.kik.com', 'zed@talk.kik.com'),
           ('g1@groups.kik.com', 'amy@talk.kik.com'),
           ('g1@groups.kik.com', 'amy@talk.kik.com');",
    )
    .expect("members");
    insert_message(&conn, 1, "g1@groups.kik.com", Some(0), Some("hello"), Some(1_700_000_000_000), None);
    insert_message(&conn, 2, "g2@groups.kik.com", Some(1), Some("orphan"), Some(1_700_000_000_000), None);

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let group = &sheets[1];
    assert_eq!(group.rows.len(), 2);
    let participants = column(group, "participants");
    assert_eq!(text(&group.rows[0][participants]), "amy@talk.kik.com, zed@talk.kik.com");
    assert_eq!(group.rows[1][participants], Cell::Empty);
    assert_eq!(text(&group.rows[0][column(group, "conversation_kind")]), "GROUP");
    assert!(sheets[0].rows.is_empty());
    assert_eq!(ctx.stats().membership.emitted, 3);
}

#[test]
fn content_without_payload_reports_no_image_data() {
    let conn = empty_backup();
    insert_message(&conn, 1, "42", Some(0), None, Some(1_700_000_000), Some("7"));
    insert_message(&conn, 2, "42", Some(1), None, Some(1_700_000_000), Some("8"));
    conn.execute(
        "INSERT INTO KIKContentTable (content_id, content_name, content_string) VALUES ('8', 'preview', 'img-8');",
        [],
    )
    .expect("content");
    conn.execute(
        "INSERT INTO AccountSwitcherImgBackupTable (image_id, image_bytes) VALUES ('img-8', ?1);",
        params![JPEG_SAMPLE],
    )
    .expect("blob");

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let images = &sheets[2];
    assert_eq!(images.rows.len(), 2);
    let image_file = column(images, "image_file");
    let image_id = column(images, "image_id");
    assert_eq!(text(&images.rows[0][image_id]), "7");
    assert_eq!(text(&images.rows[0][image_file]), "no image data");
    assert_eq!(text(&images.rows[1][image_id]), "img-8");
    assert_eq!(text(&images.rows[1][image_file]), "img-8.jpg");
    assert_eq!(images.rows[1][column(images, "retain_count")], Cell::Empty);
    assert_eq!(ctx.stats().content_without_image, 1);
}

#[test]
fn chunk_size_does_not_change_the_export() {
    let conn = empty_backup();
    seed_demo_backup(&conn, 25, 11).expect("seed");
    insert_message(&conn, 500, "42", Some(3), Some("bad"), Some(1), Some("c-jpeg"));

    let mut baseline_ctx = RunContext::default();
    let baseline = export(&conn, &ExtractConfig::default(), &mut baseline_ctx);
    for chunk_size in [1, 4, 39] {
        let config = ExtractConfig {
            chunk_size,
            ..ExtractConfig::default()
        };
        let mut ctx = RunContext::default();
        let sheets = export(&conn, &config, &mut ctx);
        assert_eq!(sheets, baseline, "chunk size {chunk_size}");
        assert_eq!(ctx.stats().private_messages, baseline_ctx.stats().private_messages);
        assert_eq!(ctx.diagnostics_recorded(), baseline_ctx.diagnostics_recorded());
    }
    assert_eq!(baseline[0].rows.len(), 25 + 2);
    assert_eq!(baseline[1].rows.len(), 11 + 1);
    assert_eq!(baseline[2].rows.len(), 3);
    // the rejected content row is reported and counted once, by the private pass
    assert_eq!(baseline_ctx.diagnostics_recorded(), 1);
    assert_eq!(baseline_ctx.stats().private_messages.skipped, 1);
    assert_eq!(baseline_ctx.stats().content.skipped, 0);
    assert!(baseline[1]
        .rows
        .iter()
        .all(|row| text(&row[1]) == DEMO_GROUP_JID));
}

#[test]
fn retain_count_table_is_optional() {
    let conn = Connection::open_in_memory().expect("memory db");
    let ddl = SOURCE_DDL.replace(
        "CREATE TABLE IF NOT EXISTS KIKContentRetainCountTable (\n  content_id TEXT,\n  retain_count INTEGER\n);",
        "",
    );
    conn.execute_batch(&ddl).expect("ddl");
    insert_message(&conn, 1, "42", Some(1), None, None, Some("c1"));
    conn.execute(
        "INSERT INTO KIKContentURITable (content_id, content_uri) VALUES ('c1', 'content://x/c1');",
        [],
    )
    .expect("uri");

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let images = &sheets[2];
    assert_eq!(text(&images.rows[0][column(images, "content_uri")]), "content://x/c1");
    assert_eq!(images.rows[0][column(images, "retain_count")], Cell::Empty);
}

#[test]
fn out_of_range_timestamps_are_unknown_with_a_warning() {
    let conn = empty_backup();
    insert_message(&conn, 1, "42", Some(1), Some("far"), Some(i64::MAX), None);

    let sink = MemorySink::new();
    let mut ctx = RunContext::new(Box::new(sink.clone()));
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let private = &sheets[0];
    assert_eq!(text(&private.rows[0][column(private, "timestamp")]), "unknown");
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, DiagnosticKind::InvalidTimestamp);
    assert_eq!(events[0].row.as_deref(), Some("1"));
}

#[test]
fn status_text_is_exported_on_message_sheets() {
    let conn = empty_backup();
    conn.execute(
        "INSERT INTO messagesTable (_id, bin_id, partner_jid, was_me, body, timestamp, stat_msg, stat_user_jid, friend_attr_id) \
         VALUES (1, 'g1@groups.kik.com', NULL, 0, NULL, 1700000000000, 'bob has joined the chat', 'bob@talk.kik.com', 'fa-9');",
        [],
    )
    .expect("status row");
    insert_message(&conn, 2, "42", Some(1), Some("hi"), Some(1_700_000_000), None);

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let group = &sheets[1];
    assert_eq!(group.rows.len(), 1);
    let row = &group.rows[0];
    assert_eq!(text(&row[column(group, "body")]), "");
    assert_eq!(text(&row[column(group, "stat_msg")]), "bob has joined the chat");
    assert_eq!(text(&row[column(group, "stat_user_jid")]), "bob@talk.kik.com");
    assert_eq!(text(&row[column(group, "friend_attr_id")]), "fa-9");

    let private = &sheets[0];
    assert_eq!(private.rows[0][column(private, "stat_msg")], Cell::Empty);
}

#[test]
fn status_columns_are_optional() {
    let conn = Connection::open_in_memory().expect("memory db");
    let ddl = SOURCE_DDL.replace(
        "  content_id TEXT,\n  stat_msg TEXT,\n  stat_user_jid TEXT,\n  friend_attr_id TEXT\n",
        "  content_id TEXT\n",
    );
    assert_ne!(ddl, SOURCE_DDL);
    conn.execute_batch(&ddl).expect("ddl");
    insert_message(&conn, 1, "42", Some(0), Some("older client"), Some(1_700_000_000), None);

    let mut ctx = RunContext::default();
    let sheets = export(&conn, &ExtractConfig::default(), &mut ctx);
    let private = &sheets[0];
    assert_eq!(text(&private.rows[0][column(private, "body")]), "older client");
    assert_eq!(private.rows[0][column(private, "stat_msg")], Cell::Empty);
    assert_eq!(private.rows[0][column(private, "friend_attr_id")], Cell::Empty);
    assert_eq!(ctx.diagnostics_recorded(), 0);
}
