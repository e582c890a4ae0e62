use std::collections::BTreeSet;
use std::fs;

use calamine::{Data, Range};
use rusqlite::Connection;

use super::delimited::CsvRows;
use super::spreadsheet::{SheetRows, cell_value};
use super::*;

fn collect_ok(source: RecordSource) -> Vec<RawRecord> {
    source
        .records
        .map(|item| item.expect("record should read"))
        .collect()
}

#[test]
fn sheet_rows_use_header_names_and_skip_empty_rows() {
    let mut range = Range::new((0, 0), (3, 1));
    range.set_value((0, 0), Data::String("VoterNumber".to_string()));
    range.set_value((0, 1), Data::String(" Name ".to_string()));
    range.set_value((1, 0), Data::Float(1001.0));
    range.set_value((1, 1), Data::String("Ali Hassan".to_string()));
    range.set_value((3, 0), Data::Int(1002));

    let rows: Vec<RawRecord> = SheetRows::new("voters.xlsx#Sheet1".to_string(), range, 0, RecordKind::Voter)
        .expect("sheet should open")
        .map(|item| item.expect("row should read"))
        .collect();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fields.get("VoterNumber"), Some(&RawValue::Float(1001.0)));
    assert_eq!(rows[0].fields.get("Name"), Some(&RawValue::Text("Ali Hassan".to_string())));
    assert_eq!(rows[0].location.to_string(), "voters.xlsx#Sheet1:2");
    assert_eq!(rows[1].location.position, 4);
    assert!(!rows[1].fields.contains_key("Name"));
}

#[test]
fn sheet_rows_honour_skip_rows_after_header() {
    let mut range = Range::new((0, 0), (2, 0));
    range.set_value((0, 0), Data::String("CenterNumber".to_string()));
    range.set_value((1, 0), Data::String("TOTAL".to_string()));
    range.set_value((2, 0), Data::Int(3001));

    let rows = SheetRows::new("centers".to_string(), range, 1, RecordKind::PollingCenter)
        .expect("sheet should open");
    assert_eq!(rows.data_rows(), 1);
    let rows: Vec<RawRecord> = rows.map(|item| item.expect("row should read")).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, RecordKind::PollingCenter);
    assert_eq!(rows[0].fields.get("CenterNumber"), Some(&RawValue::Integer(3001)));
}

#[test]
fn error_cells_are_record_errors() {
    let mut range = Range::new((0, 0), (1, 0));
    range.set_value((0, 0), Data::String("VoterNumber".to_string()));
    range.set_value((1, 0), Data::Error(calamine::CellErrorType::Ref));

    let mut rows = SheetRows::new("broken".to_string(), range, 0, RecordKind::Voter)
        .expect("sheet should open");
    let failure = rows
        .next()
        .expect("row should be yielded")
        .expect_err("error cell should fail the row");
    assert!(matches!(failure.error, RecordError::UnsupportedCell { .. }));
}

#[test]
fn cell_values_render_as_stored_strings() {
    assert_eq!(
        cell_value(&Data::Float(1599354.0)).expect("float").render(),
        Some("1599354".to_string())
    );
    assert_eq!(
        cell_value(&Data::String("  ".to_string())).expect("blank"),
        RawValue::Null
    );
    assert_eq!(RawValue::Float(2.5).render(), Some("2.5".to_string()));
}

#[test]
fn csv_rows_map_headers_and_number_lines() {
    let input = "\u{feff}VoterNumber,Name,Phone\n1001,Ali Hassan,\n\"1002\",\"Sara Kareem\",07701234567\n";
    let rows: Vec<RawRecord> = CsvRows::new("voters.csv".to_string(), input.as_bytes(), 0, RecordKind::Voter)
        .expect("csv should open")
        .map(|item| item.expect("row should read"))
        .collect();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fields.get("VoterNumber"), Some(&RawValue::Text("1001".to_string())));
    assert!(!rows[0].fields.contains_key("Phone"));
    assert_eq!(rows[1].location.position, 3);
    assert_eq!(rows[1].fields.get("Name"), Some(&RawValue::Text("Sara Kareem".to_string())));
}

#[test]
fn json_array_batches_carry_model_pk_and_fields() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = dir.path().join("voters_batch_001.json");
    fs::write(
        &path,
        r#"[
          {"model": "elections.voter", "pk": 10, "fields": {"voter_number": "1001", "phone": null}},
          {"model": "elections.ballot", "pk": 11, "fields": {}},
          {"pk": 12}
        ]"#,
    )
    .expect("batch should write");

    let source = open_json_batch(&path).expect("batch should open");
    assert_eq!(source.total, Some(3));
    let items: Vec<RecordResult> = source.records.collect();

    let first = items[0].as_ref().expect("first envelope should parse");
    assert_eq!(first.kind, RecordKind::Voter);
    assert_eq!(first.source_pk, Some(10));
    assert_eq!(first.fields.get("voter_number"), Some(&RawValue::Text("1001".to_string())));
    assert!(!first.fields.contains_key("phone"));

    let unknown = items[1].as_ref().expect_err("unknown model should fail");
    assert!(matches!(unknown.error, RecordError::UnknownModel { .. }));
    let malformed = items[2].as_ref().expect_err("missing model should fail");
    assert!(matches!(malformed.error, RecordError::Malformed { .. }));
    assert_eq!(malformed.location.position, 3);
}

#[test]
fn json_line_batches_are_read_lazily_line_by_line() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = dir.path().join("voters_batch_002.jsonl");
    fs::write(
        &path,
        "{\"model\": \"elections.voter\", \"pk\": \"21\", \"fields\": {\"voter_number\": 2001}}\n\n{not json}\n",
    )
    .expect("batch should write");

    let source = open_json_batch(&path).expect("batch should open");
    assert_eq!(source.total, None);
    let items: Vec<RecordResult> = source.records.collect();
    assert_eq!(items.len(), 2);

    let first = items[0].as_ref().expect("first line should parse");
    assert_eq!(first.source_pk, Some(21));
    assert_eq!(first.fields.get("voter_number"), Some(&RawValue::Integer(2001)));
    let failure = items[1].as_ref().expect_err("broken line should fail");
    assert_eq!(failure.location.position, 3);
}

#[test]
fn batch_directory_reads_selected_batches_in_number_order() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    for (name, voter) in [
        ("voters_batch_10.json", "10"),
        ("voters_batch_2.json", "2"),
        ("voters_batch_3.json", "3"),
        ("voters_batch_1.json", "1"),
    ] {
        fs::write(
            dir.path().join(name),
            format!(r#"[{{"model": "elections.voter", "fields": {{"voter_number": "{voter}"}}}}]"#),
        )
        .expect("batch should write");
    }
    fs::write(dir.path().join("notes.txt"), "ignored").expect("notes should write");

    let names: Vec<String> = list_batch_files(dir.path())
        .expect("listing should succeed")
        .into_iter()
        .map(|file| file.name)
        .collect();
    assert_eq!(
        names,
        vec![
            "voters_batch_1.json",
            "voters_batch_2.json",
            "voters_batch_3.json",
            "voters_batch_10.json"
        ]
    );

    let mut spec = SourceSpec::new(
        SourceFormat::JsonBatchDir,
        dir.path().to_path_buf(),
        RecordKind::Voter,
    );
    spec.start_batch = Some(2);
    spec.exclude_batches = BTreeSet::from([3]);
    let voters: Vec<String> = collect_ok(open_source(&spec).expect("directory should open"))
        .into_iter()
        .filter_map(|record| record.fields.get("voter_number").and_then(RawValue::render))
        .collect();
    assert_eq!(voters, vec!["2", "10"]);
}

#[test]
fn legacy_sqlite_prefers_voter_table_and_pages_every_row() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = dir.path().join("legacy.db");
    {
        let connection = Connection::open(&path).expect("legacy db should open");
        connection
            .execute_batch(
                "CREATE TABLE settings (key TEXT);
                 CREATE TABLE VoterRecords (VoterNumber TEXT, Name TEXT, BirthDate TEXT);",
            )
            .expect("legacy schema should create");
        let tx = connection.unchecked_transaction().expect("transaction should begin");
        {
            let mut insert = tx
                .prepare("INSERT INTO VoterRecords VALUES (?1, ?2, ?3)")
                .expect("insert should prepare");
            for n in 0..4_500 {
                insert
                    .execute(rusqlite::params![format!("{}", 100_000 + n), "Name", ""])
                    .expect("row should insert");
            }
        }
        tx.commit().expect("rows should commit");
    }

    let spec = SourceSpec::new(SourceFormat::LegacySqlite, path, RecordKind::Voter);
    let source = open_source(&spec).expect("legacy db should open");
    assert_eq!(source.total, Some(4_500));
    assert!(source.sha256.is_some());
    let records = collect_ok(source);
    assert_eq!(records.len(), 4_500);
    assert_eq!(
        records[4_499].fields.get("VoterNumber"),
        Some(&RawValue::Text("104499".to_string()))
    );
    assert!(!records[0].fields.contains_key("BirthDate"));
}

#[test]
fn legacy_sqlite_rejects_unknown_table() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = dir.path().join("legacy.db");
    Connection::open(&path)
        .expect("legacy db should open")
        .execute_batch("CREATE TABLE PersonHD (per_id TEXT);")
        .expect("schema should create");

    let mut spec = SourceSpec::new(SourceFormat::LegacySqlite, path, RecordKind::Voter);
    spec.table = Some("Missing".to_string());
    let error = open_source(&spec).expect_err("unknown table should fail");
    assert!(error.to_string().contains("table `Missing` not found"));
}

#[test]
fn missing_source_file_is_a_configuration_error() {
    let spec = SourceSpec::new(
        SourceFormat::Csv,
        "/nonexistent/voters.csv".into(),
        RecordKind::Voter,
    );
    assert!(open_source(&spec).is_err());
}
