use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use rusqlite::Connection;

use super::pipeline::{ImportOptions, MAX_BATCH_SIZE, run_pipeline};
use super::progress::{ImportHandle, LOG_CAPACITY, spawn_import};
use super::run::{render_import_command, run_status};
use crate::cli::{EmptyValuePolicy, ImportArgs, SourceFormat, UpsertPolicy};
use crate::mapping::{AliasTable, VoterField};
use crate::model::{ImportRunStats, RecordKind};
use crate::sources::{RawRecord, RawValue, RecordLocation, RecordResult, RecordSource, open_json_batch};
use crate::store::{count_rows, open_test_store};

fn row(position: u64, fields: &[(&str, &str)]) -> RecordResult {
    Ok(RawRecord {
        location: RecordLocation::new("memory", position),
        kind: RecordKind::Voter,
        source_pk: None,
        fields: fields
            .iter()
            .map(|(name, value)| (name.to_string(), RawValue::Text(value.to_string())))
            .collect::<HashMap<_, _>>(),
    })
}

fn voters(numbers: &[&str]) -> Vec<RecordResult> {
    numbers
        .iter()
        .enumerate()
        .map(|(index, number)| {
            row(
                index as u64 + 1,
                &[("VoterNumber", number), ("Name", "Voter"), ("Governorate", "Basra")],
            )
        })
        .collect()
}

fn source_of(records: Vec<RecordResult>) -> RecordSource {
    RecordSource {
        label: "memory".to_string(),
        total: Some(records.len() as u64),
        sha256: None,
        records: Box::new(records.into_iter()),
    }
}

fn import(
    connection: &mut Connection,
    records: Vec<RecordResult>,
    options: &ImportOptions,
) -> ImportRunStats {
    run_pipeline(
        connection,
        source_of(records),
        &AliasTable::<VoterField>::builtin(),
        options,
        &ImportHandle::new(),
    )
    .expect("pipeline should run")
}

fn voter_count(connection: &Connection) -> i64 {
    count_rows(connection, "SELECT COUNT(*) FROM voters").expect("voters should count")
}

fn small_batches(size: usize) -> ImportOptions {
    ImportOptions {
        batch_size: size,
        ..ImportOptions::default()
    }
}

#[test]
fn second_import_of_the_same_source_creates_nothing() {
    let mut connection = open_test_store();
    let numbers = ["1001", "1002", "1003", "1004", "1005"];

    let first = import(&mut connection, voters(&numbers), &small_batches(2));
    assert_eq!(first.created, 5);
    assert_eq!(first.batches, 3);

    let second = import(&mut connection, voters(&numbers), &small_batches(2));
    assert_eq!(second.created, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(voter_count(&connection), 5);
}

#[test]
fn duplicate_keys_create_at_most_one_row() {
    let mut connection = open_test_store();
    let stats = import(
        &mut connection,
        voters(&["7", "7", "8", "7"]),
        &small_batches(3),
    );

    assert_eq!(stats.created, 2);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.conflicts_absorbed, 1);
    assert_eq!(voter_count(&connection), 2);
}

#[test]
fn records_without_voter_number_are_skipped_not_errored() {
    let mut connection = open_test_store();
    let records = vec![
        row(1, &[("Name", "No Key")]),
        row(2, &[("VoterNumber", "2001"), ("BirthDate", "not a date")]),
        row(3, &[("VoterNumber", "2002")]),
    ];

    let stats = import(&mut connection, records, &small_batches(10));
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.missing_key, 1);
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.record_errors.len(), 2);
    assert_eq!(stats.record_errors[1].key.as_deref(), Some("2001"));
    assert_eq!(stats.record_errors[1].location, "memory:2");
}

#[test]
fn failing_batch_is_rolled_back_and_the_run_continues() {
    let mut connection = open_test_store();
    connection
        .execute_batch(
            "CREATE TRIGGER reject_poisoned BEFORE INSERT ON voters
             WHEN NEW.voter_number = 'V014'
             BEGIN SELECT RAISE(ABORT, 'simulated constraint violation'); END;",
        )
        .expect("trigger should create");

    let numbers: Vec<String> = (0..30).map(|n| format!("V{n:03}")).collect();
    let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();
    let stats = import(&mut connection, voters(&refs), &small_batches(3));

    assert_eq!(stats.batches, 10);
    assert_eq!(stats.created, 27);
    assert_eq!(stats.errored, 3);
    assert_eq!(stats.batch_failures.len(), 1);
    let failure = &stats.batch_failures[0];
    assert_eq!(failure.batch_number, 5);
    assert_eq!(failure.first_key.as_deref(), Some("V012"));
    assert_eq!(failure.last_key.as_deref(), Some("V014"));
    assert_eq!(failure.offending_key.as_deref(), Some("V014"));
    assert!(failure.message.contains("simulated constraint violation"));

    assert_eq!(voter_count(&connection), 27);
    let rolled_back = count_rows(
        &connection,
        "SELECT COUNT(*) FROM voters WHERE voter_number IN ('V012', 'V013')",
    )
    .expect("count should run");
    assert_eq!(rolled_back, 0);
    assert_eq!(run_status(&stats, false), "completed_with_errors");
}

#[test]
fn update_existing_preserve_keeps_stored_values() {
    let mut connection = open_test_store();
    import(
        &mut connection,
        vec![row(1, &[("VoterNumber", "9"), ("Name", "Old Name"), ("Phone", "07700000001")])],
        &ImportOptions::default(),
    );

    let options = ImportOptions {
        policy: UpsertPolicy::UpdateExisting,
        empty_values: Some(EmptyValuePolicy::Preserve),
        ..ImportOptions::default()
    };
    let stats = import(
        &mut connection,
        vec![row(1, &[("VoterNumber", "9"), ("Name", "New Name"), ("Phone", "")])],
        &options,
    );
    assert_eq!(stats.updated, 1);

    let (name, phone): (String, String) = connection
        .query_row("SELECT full_name, phone FROM voters WHERE voter_number = '9'", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .expect("voter should read");
    assert_eq!(name, "New Name");
    assert_eq!(phone, "07700000001");
}

#[test]
fn skip_existing_never_touches_stored_rows() {
    let mut connection = open_test_store();
    import(&mut connection, vec![row(1, &[("VoterNumber", "9"), ("Name", "Old Name")])], &ImportOptions::default());
    let stats = import(
        &mut connection,
        vec![row(1, &[("VoterNumber", "9"), ("Name", "New Name")])],
        &ImportOptions::default(),
    );

    assert_eq!(stats.skipped, 1);
    let name: String = connection
        .query_row("SELECT full_name FROM voters WHERE voter_number = '9'", [], |r| r.get(0))
        .expect("voter should read");
    assert_eq!(name, "Old Name");
}

#[test]
fn dry_run_counts_without_writing() {
    let mut connection = open_test_store();
    import(&mut connection, voters(&["1"]), &ImportOptions::default());

    let options = ImportOptions {
        dry_run: true,
        ..ImportOptions::default()
    };
    let stats = import(&mut connection, voters(&["1", "2", "3"]), &options);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(voter_count(&connection), 1);
    assert_eq!(run_status(&stats, true), "dry_run");
}

#[test]
fn dry_run_counts_a_key_repeated_across_batches_once() {
    let mut connection = open_test_store();
    let options = ImportOptions {
        batch_size: 2,
        dry_run: true,
        ..ImportOptions::default()
    };
    let stats = import(&mut connection, voters(&["1", "2", "1", "3", "2"]), &options);

    assert_eq!(stats.batches, 3);
    assert_eq!(stats.created, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(voter_count(&connection), 0);
}

#[test]
fn taken_source_primary_key_does_not_drop_a_different_voter() {
    let mut connection = open_test_store();
    import(&mut connection, voters(&["A-1"]), &ImportOptions::default());

    let mut record = row(1, &[("VoterNumber", "B-2"), ("Name", "Second Voter")]);
    if let Ok(raw) = record.as_mut() {
        raw.source_pk = Some(1);
    }
    let stats = import(&mut connection, vec![record], &ImportOptions::default());

    assert_eq!(stats.created, 1);
    assert_eq!(stats.pk_reassigned, 1);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.conflicts_absorbed, 0);
    assert_eq!(
        count_rows(&connection, "SELECT COUNT(*) FROM voters WHERE voter_number = 'B-2'")
            .expect("voter should count"),
        1
    );
    assert_eq!(voter_count(&connection), 2);
}

#[test]
fn offset_and_limit_select_a_window_of_the_source() {
    let mut connection = open_test_store();
    let options = ImportOptions {
        offset: 1,
        limit: Some(2),
        ..ImportOptions::default()
    };
    let stats = import(&mut connection, voters(&["a", "b", "c", "d"]), &options);

    assert_eq!(stats.processed, 2);
    let mut statement = connection
        .prepare("SELECT voter_number FROM voters ORDER BY voter_number")
        .expect("query should prepare");
    let stored: Vec<String> = statement
        .query_map([], |r| r.get(0))
        .expect("query should run")
        .collect::<Result<_, _>>()
        .expect("rows should read");
    assert_eq!(stored, vec!["b", "c"]);
}

#[test]
fn filters_drop_non_matching_records() {
    let mut connection = open_test_store();
    let options = ImportOptions {
        filters: vec!["governorate=Najaf".parse().expect("filter should parse")],
        ..ImportOptions::default()
    };
    let records = vec![
        row(1, &[("VoterNumber", "1"), ("Governorate", "Najaf")]),
        row(2, &[("VoterNumber", "2"), ("Governorate", "Basra")]),
    ];
    let stats = import(&mut connection, records, &options);

    assert_eq!(stats.created, 1);
    assert_eq!(stats.filtered_out, 1);
}

#[test]
fn update_policy_requires_an_explicit_empty_value_choice() {
    let missing = ImportOptions {
        policy: UpsertPolicy::UpdateExisting,
        ..ImportOptions::default()
    };
    assert!(missing.validated().is_err());

    let misplaced = ImportOptions {
        empty_values: Some(EmptyValuePolicy::Overwrite),
        ..ImportOptions::default()
    };
    assert!(misplaced.validated().is_err());

    let oversized = ImportOptions {
        batch_size: 1_000_000,
        ..ImportOptions::default()
    }
    .validated()
    .expect("oversized batch should clamp");
    assert_eq!(oversized.batch_size, MAX_BATCH_SIZE);

    let zero = ImportOptions {
        batch_size: 0,
        ..ImportOptions::default()
    }
    .validated()
    .expect("zero batch should clamp");
    assert_eq!(zero.batch_size, 1);
}

#[test]
fn handle_reports_progress_and_bounds_its_log() {
    let mut connection = open_test_store();
    let handle = ImportHandle::new();
    let numbers: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();

    run_pipeline(
        &mut connection,
        source_of(voters(&refs)),
        &AliasTable::builtin(),
        &small_batches(4),
        &handle,
    )
    .expect("pipeline should run");

    let snapshot = handle.snapshot();
    assert!(!snapshot.running);
    assert_eq!(snapshot.total, Some(10));
    assert_eq!(snapshot.processed, 10);
    assert_eq!(snapshot.created, 10);
    assert_eq!(snapshot.current_batch, 3);
    assert_eq!(snapshot.log.len(), 3);
    assert!(snapshot.log[0].starts_with("batch 1:"));

    for n in 0..(LOG_CAPACITY + 5) {
        handle.push_log(format!("line {n}"));
    }
    let log = handle.snapshot().log;
    assert_eq!(log.len(), LOG_CAPACITY);
    assert_eq!(log.last().map(String::as_str), Some("line 204"));
}

#[test]
fn json_blank_field_does_not_hide_a_filled_alias() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let batch_path = dir.path().join("voters_batch_004.jsonl");
    fs::write(
        &batch_path,
        "{\"model\": \"elections.voter\", \"pk\": 40, \"fields\": {\"VoterNumber\": \"\", \"voter_number\": \"123\"}}\n",
    )
    .expect("batch should write");

    let mut connection = open_test_store();
    let source = open_json_batch(&batch_path).expect("batch should open");
    let stats = run_pipeline(
        &mut connection,
        source,
        &AliasTable::<VoterField>::builtin(),
        &ImportOptions::default(),
        &ImportHandle::new(),
    )
    .expect("pipeline should run");

    assert_eq!(stats.created, 1);
    assert_eq!(stats.missing_key, 0);
    assert_eq!(
        count_rows(&connection, "SELECT COUNT(*) FROM voters WHERE voter_number = '123' AND id = 40")
            .expect("voter should count"),
        1
    );
}

#[test]
fn spawned_import_keeps_batch_primary_keys() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let batch_path = dir.path().join("voters_batch_001.json");
    fs::write(
        &batch_path,
        r#"[
          {"model": "elections.voter", "pk": 1599354, "fields": {"voter_number": "55501", "full_name": "Ali"}},
          {"model": "elections.voter", "pk": 1599355, "fields": {"voter_number": "55502"}}
        ]"#,
    )
    .expect("batch should write");
    let db_path = dir.path().join("voters.sqlite");

    let source = open_json_batch(&batch_path).expect("batch should open");
    let (handle, worker) = spawn_import(
        db_path.clone(),
        source,
        AliasTable::builtin(),
        ImportOptions::default(),
    )
    .expect("worker should spawn");
    let stats = worker
        .join()
        .expect("worker should not panic")
        .expect("import should succeed");

    assert_eq!(stats.created, 2);
    assert!(!handle.is_running());
    let connection = Connection::open(&db_path).expect("store should reopen");
    let id: i64 = connection
        .query_row("SELECT id FROM voters WHERE voter_number = '55501'", [], |r| r.get(0))
        .expect("voter should read");
    assert_eq!(id, 1_599_354);
}

#[test]
fn render_import_command_includes_update_flags() {
    let args = ImportArgs {
        work_root: PathBuf::from(".cache/voterload"),
        db_path: None,
        format: SourceFormat::LegacySqlite,
        input: PathBuf::from("legacy.db"),
        sheet: None,
        skip_rows: 0,
        table: Some("PersonHD".to_string()),
        alias_table: None,
        batch_size: 5000,
        policy: UpsertPolicy::UpdateExisting,
        empty_values: Some(EmptyValuePolicy::Preserve),
        offset: 0,
        limit: Some(100),
        filters: vec!["governorate=Basra".to_string()],
        dry_run: true,
        start_batch: None,
        end_batch: None,
        skip_applied: false,
        checkpoints: None,
        heartbeat_secs: 30,
        report_path: None,
    };

    let command = render_import_command(&args);
    assert!(command.starts_with("voterload import --work-root .cache/voterload --format legacy-sqlite"));
    assert!(command.contains("--table PersonHD"));
    assert!(command.contains("--policy update-existing --empty-values preserve"));
    assert!(command.contains("--limit 100"));
    assert!(command.contains("--filter governorate=Basra"));
    assert!(command.ends_with("--dry-run"));
}
