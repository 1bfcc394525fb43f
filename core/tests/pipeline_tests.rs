use std::fs;
use std::path::Path;

use blue_kik_core::context::RunContext;
use blue_kik_core::diagnostics::{DiagnosticKind, MemorySink};
use blue_kik_core::export::{MAX_CELL_CHARS, TRUNCATION_MARKER};
use blue_kik_core::pipeline::{
    export_file_name, image_dir_name, image_index_name, report_file_name, run_export,
    run_export_with_report, run_image_extraction, ExtractConfig, INDEX_COLUMNS,
};
use blue_kik_core::seed::{write_demo_backup, DEMO_CONTENT_MESSAGES};
use blue_kik_core::{CoreError, ExistingFilePolicy};
use calamine::{open_workbook_auto, Data, Reader};
use tempfile::tempdir;

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => format!("{}", f),
        Data::Int(i) => format!("{}", i),
        other => format!("{}", other),
    }
}

fn read_sheets(path: &Path) -> Vec<(String, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path).expect("open workbook");
    let names = workbook.sheet_names().to_vec();
    names
        .into_iter()
        .map(|name| {
            let range = workbook.worksheet_range(&name).expect("sheet");
            let rows = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect())
                .collect();
            (name, rows)
        })
        .collect()
}

#[test]
fn export_writes_three_sheets_in_order() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kikDatabase.backup");
    write_demo_backup(&backup, 5, 3).expect("seed");
    let dest = dir.path().join(export_file_name(&backup));

    let mut ctx = RunContext::default();
    let path = run_export(&backup, &dest, &ExtractConfig::default(), &mut ctx).expect("export");
    assert_eq!(path, dest);

    let sheets = read_sheets(&dest);
    let names: Vec<&str> = sheets.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["Private Messages", "Group Messages", "Images"]);

    let (_, private) = &sheets[0];
    assert_eq!(private[0][0], "message_id");
    assert_eq!(private[0][3], "sender");
    assert_eq!(private.len(), 1 + 5 + 2);
    assert_eq!(private[1][3], "OWNER");
    assert_eq!(private[1][5], "2023-11-14T22:13:20Z");
    assert_eq!(private[2][3], "OTHER");

    let (_, group) = &sheets[1];
    assert_eq!(group.len(), 1 + 3 + 1);
    assert_eq!(group[1][8], "alice_k3p@talk.kik.com, bob_r7q@talk.kik.com");

    let (_, images) = &sheets[2];
    assert_eq!(images.len(), 1 + DEMO_CONTENT_MESSAGES as usize);
    let files: Vec<&str> = images[1..].iter().map(|row| row[8].as_str()).collect();
    assert_eq!(files, vec!["img-jpeg.jpg", "c-png.png", "no image data"]);
    assert_eq!(images[1][6], "content://com.kik.android/c-jpeg");
    assert_eq!(images[1][9], "1");
    assert_eq!(images[1][5], "preview, file-name");

    let summary = ctx.summarize("export", &backup.display().to_string(), vec![]);
    assert_eq!(summary.stats.content_without_image, 1);
    assert_eq!(summary.diagnostics, 0);
}

#[test]
fn export_is_idempotent() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 12, 4).expect("seed");
    let dest = dir.path().join("out").join("export.xlsx");

    run_export(&backup, &dest, &ExtractConfig::default(), &mut RunContext::default()).expect("first");
    let first = read_sheets(&dest);
    run_export(&backup, &dest, &ExtractConfig::default(), &mut RunContext::default()).expect("second");
    assert_eq!(read_sheets(&dest), first);
    assert_eq!(fs::read_dir(dir.path().join("out")).expect("dir").count(), 1);
}

#[test]
fn export_leaves_the_backup_untouched() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 3, 1).expect("seed");
    let before = fs::read(&backup).expect("read");
    run_export(&backup, &dir.path().join("x.xlsx"), &ExtractConfig::default(), &mut RunContext::default())
        .expect("export");
    assert_eq!(fs::read(&backup).expect("read"), before);
}

#[test]
fn image_extraction_writes_files_and_index() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 2, 1).expect("seed");

    let mut ctx = RunContext::default();
    let extraction =
        run_image_extraction(&backup, dir.path(), &ExtractConfig::default(), &mut ctx).expect("images");
    assert_eq!(extraction.image_dir, dir.path().join(image_dir_name(&backup)));
    assert_eq!(extraction.index_path, dir.path().join(image_index_name(&backup)));

    let mut files: Vec<String> = fs::read_dir(&extraction.image_dir)
        .expect("dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["c-png.png", "img-jpeg.jpg", "img-unknown.bin"]);
    assert!(!files.iter().any(|name| name.starts_with("img-missing") || name.starts_with("img-empty")));

    let mut reader = csv::Reader::from_path(&extraction.index_path).expect("index");
    let headers: Vec<String> = reader.headers().expect("headers").iter().map(String::from).collect();
    assert_eq!(headers, INDEX_COLUMNS);
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("record")).collect();
    assert_eq!(records.len(), 3);
    assert_eq!(&records[0][0], "c-png");
    assert_eq!(&records[0][1], "c-png.png");
    assert_eq!(&records[0][5], "written");

    let stats = &ctx.stats().images;
    assert_eq!((stats.written, stats.empty, stats.failed), (3, 1, 0));
}

#[test]
fn image_rerun_skips_existing_files() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 1, 0).expect("seed");
    let config = ExtractConfig::default();

    run_image_extraction(&backup, dir.path(), &config, &mut RunContext::default()).expect("first");
    let mut ctx = RunContext::default();
    let extraction = run_image_extraction(&backup, dir.path(), &config, &mut ctx).expect("second");
    assert_eq!(ctx.stats().images.written, 0);
    assert_eq!(ctx.stats().images.skipped_existing, 3);
    assert_eq!(fs::read_dir(&extraction.image_dir).expect("dir").count(), 3);
    let index = fs::read_to_string(&extraction.index_path).expect("index");
    assert_eq!(index.matches("skipped_existing").count(), 3);

    let overwrite = ExtractConfig {
        existing_files: ExistingFilePolicy::Overwrite,
        ..ExtractConfig::default()
    };
    let mut ctx = RunContext::default();
    run_image_extraction(&backup, dir.path(), &overwrite, &mut ctx).expect("overwrite");
    assert_eq!(ctx.stats().images.written, 3);
}

#[test]
fn image_extraction_only_needs_the_payload_table() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("images-only.backup");
    let conn = rusqlite::Connection::open(&backup).expect("open");
    conn.execute_batch(
        "CREATE TABLE AccountSwitcherImgBackupTable (image_id TEXT PRIMARY KEY, image_bytes BLOB);
         INSERT INTO AccountSwitcherImgBackupTable VALUES ('x', x'FFD8FFE0');",
    )
    .expect("schema");
    drop(conn);

    let mut ctx = RunContext::default();
    let extraction =
        run_image_extraction(&backup, dir.path(), &ExtractConfig::default(), &mut ctx).expect("images");
    assert!(extraction.image_dir.join("x.jpg").is_file());

    let mut ctx = RunContext::default();
    let err = run_export(&backup, &dir.path().join("x.xlsx"), &ExtractConfig::default(), &mut ctx)
        .unwrap_err();
    assert!(matches!(err, CoreError::SchemaMismatch { .. }));
}

#[test]
fn zero_chunk_size_is_rejected() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 1, 0).expect("seed");
    let config = ExtractConfig {
        chunk_size: 0,
        ..ExtractConfig::default()
    };
    let dest = dir.path().join("x.xlsx");
    let err = run_export(&backup, &dest, &config, &mut RunContext::default()).unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
    assert!(!dest.exists());
}

#[test]
fn oversized_cells_are_cut_and_recorded() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("long.backup");
    write_demo_backup(&backup, 1, 0).expect("seed");
    let conn = rusqlite::Connection::open(&backup).expect("open");
    conn.execute(
        "INSERT INTO messagesTable (_id, bin_id, partner_jid, was_me, body, timestamp) \
         VALUES (900, '42', '42', 1, ?1, 1700000000);",
        rusqlite::params!["x".repeat(40_000)],
    )
    .expect("long row");
    drop(conn);

    let sink = MemorySink::new();
    let mut ctx = RunContext::new(Box::new(sink.clone()));
    let dest = dir.path().join("long.xlsx");
    run_export(&backup, &dest, &ExtractConfig::default(), &mut ctx).expect("export");

    assert_eq!(ctx.stats().truncated_cells, 1);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, DiagnosticKind::CellTruncated);
    assert_eq!(events[0].pass, "private_messages");
    assert_eq!(events[0].row.as_deref(), Some("900"));
    assert!(events[0].message.contains("body"), "{}", events[0].message);

    let summary = ctx.summarize("export", "long.backup", vec![]);
    assert_eq!(summary.diagnostics, 1);
    assert_eq!(summary.stats.truncated_cells, 1);

    let sheets = read_sheets(&dest);
    let (_, private) = &sheets[0];
    let long_row = private.iter().find(|row| row[0] == "900").expect("row 900");
    let body = &long_row[6];
    assert_eq!(body.chars().count(), MAX_CELL_CHARS);
    assert!(body.ends_with(TRUNCATION_MARKER));
}

#[test]
fn report_links_content_rows_to_extracted_images() {
    let dir = tempdir().expect("temp");
    let backup = dir.path().join("kik.backup");
    write_demo_backup(&backup, 2, 1).expect("seed");
    run_image_extraction(&backup, dir.path(), &ExtractConfig::default(), &mut RunContext::default())
        .expect("images");

    let dest = dir.path().join(export_file_name(&backup));
    let report = dir.path().join(report_file_name(&backup));
    let mut ctx = RunContext::default();
    let written = run_export_with_report(
        &backup,
        &dest,
        &report,
        &ExtractConfig::default(),
        &mut ctx,
        |_| {},
    )
    .expect("export");
    assert_eq!(written.workbook, dest);
    assert_eq!(written.report, dir.path().join("kik_Report.html"));
    assert_eq!(read_sheets(&dest).len(), 3);

    let html = fs::read_to_string(&written.report).expect("report");
    for section in ["Private Messages", "Group Messages", "Images"] {
        assert!(html.contains(&format!("data-title=\"{section}\"")), "{section}");
    }
    assert!(html.contains("<img src=\"kik.backup_images/img-jpeg.jpg\""));
    assert!(dir.path().join("kik.backup_images").join("img-jpeg.jpg").is_file());
    assert!(html.contains("<td>no image data</td>"));
    assert!(html.contains("Demo message 1"));
}
