use std::fs;
use std::path::Path;

use super::*;
use crate::model::{BatchCheckpoint, VoterRecord};
use crate::store::open_test_store;
use crate::store::voters::insert_voter;

fn store_voter(connection: &rusqlite::Connection, id: i64, number: &str) {
    let record = VoterRecord {
        source_pk: Some(id),
        voter_number: number.to_string(),
        ..VoterRecord::default()
    };
    insert_voter(connection, &record, "2026-01-01T00:00:00Z").expect("voter should insert");
}

fn write_checkpoints(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("batch_checkpoints.json");
    fs::write(&path, body).expect("checkpoints should write");
    path
}

fn options(batch_dir: Option<&Path>) -> AuditOptions {
    AuditOptions {
        batch_dir: batch_dir.map(Path::to_path_buf),
        expected_count: None,
        max_batches_per_round: 10,
    }
}

#[test]
fn compress_ranges_collapses_consecutive_numbers() {
    assert_eq!(compress_ranges(&[2, 3, 4, 7, 9, 10, 11]), "2-4, 7, 9-11");
    assert_eq!(compress_ranges(&[11, 9, 10, 10, 3]), "3, 9-11");
    assert_eq!(compress_ranges(&[5]), "5");
    assert_eq!(compress_ranges(&[]), "");
}

#[test]
fn plan_rounds_chunks_missing_batches() {
    let rounds = plan_rounds(&[1, 2, 3, 8, 9], 2);
    assert_eq!(rounds.len(), 3);
    assert_eq!(rounds[0].batches, vec![1, 2]);
    assert_eq!((rounds[1].start_batch, rounds[1].end_batch), (3, 8));
    assert_eq!(rounds[2].round, 3);
    assert!(plan_rounds(&[], 10).is_empty());
}

#[test]
fn load_checkpoints_orders_by_batch_number() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = write_checkpoints(
        dir.path(),
        r#"{"batch_10": 30, "batch_02": 20, "legacy": 5, "batch_01": 10}"#,
    );

    let checkpoints = load_checkpoints(&path).expect("checkpoints should load");
    let ids: Vec<&str> = checkpoints.iter().map(|c| c.batch_id.as_str()).collect();
    assert_eq!(ids, vec!["batch_01", "batch_02", "batch_10", "legacy"]);
    assert_eq!(checkpoints[2].batch_number, Some(10));
    assert_eq!(checkpoints[3].batch_number, None);
}

#[test]
fn load_checkpoints_rejects_missing_manifest() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let err = load_checkpoints(&dir.path().join("absent.json"))
        .expect_err("missing manifest should fail");
    assert!(err.to_string().contains("checkpoint manifest not found"));
}

#[test]
fn audit_reports_applied_and_missing_batches() {
    let connection = open_test_store();
    store_voter(&connection, 1_599_354, "A1");

    let checkpoints = vec![
        BatchCheckpoint {
            batch_id: "batch_01".to_string(),
            batch_number: Some(1),
            last_pk: 1_599_354,
        },
        BatchCheckpoint {
            batch_id: "batch_02".to_string(),
            batch_number: Some(2),
            last_pk: 1_695_272,
        },
    ];

    let report = audit_checkpoints(&connection, &checkpoints, &options(None))
        .expect("audit should run");
    assert_eq!(report.applied, vec!["batch_01"]);
    assert_eq!(report.missing, vec!["batch_02"]);
    assert_eq!(report.applied_ranges, "1");
    assert_eq!(report.missing_ranges, "2");
    assert_eq!(report.voters_total, 1);
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(report.rounds[0].start_batch, 2);
    assert!(report.missing_without_batch_file.is_empty());
}

#[test]
fn audit_counts_records_of_missing_batch_files() {
    let connection = open_test_store();
    store_voter(&connection, 100, "A1");
    let dir = tempfile::tempdir().expect("tempdir should create");
    fs::write(
        dir.path().join("voters_batch_002.json"),
        r#"[
          {"model": "elections.voter", "pk": 201, "fields": {"voter_number": "B1"}},
          {"model": "elections.voter", "pk": 202, "fields": {"voter_number": "B2"}},
          {"model": "elections.voter", "pk": 203, "fields": {"voter_number": "B3"}}
        ]"#,
    )
    .expect("batch should write");

    let checkpoints = vec![
        BatchCheckpoint {
            batch_id: "voters_batch_001".to_string(),
            batch_number: Some(1),
            last_pk: 100,
        },
        BatchCheckpoint {
            batch_id: "voters_batch_002".to_string(),
            batch_number: Some(2),
            last_pk: 203,
        },
        BatchCheckpoint {
            batch_id: "voters_batch_003".to_string(),
            batch_number: Some(3),
            last_pk: 303,
        },
    ];
    let report = audit_checkpoints(
        &connection,
        &checkpoints,
        &AuditOptions {
            expected_count: Some(4),
            ..options(Some(dir.path()))
        },
    )
    .expect("audit should run");

    assert_eq!(report.missing_ranges, "2-3");
    assert_eq!(report.missing_record_count, 3);
    assert_eq!(report.missing_without_batch_file, vec!["voters_batch_003"]);
    assert_eq!(report.entries[1].record_count, Some(3));
    assert_eq!(report.completion_percent, Some(25.0));
}

#[test]
fn applied_batch_numbers_uses_checkpoint_primary_keys() {
    let connection = open_test_store();
    store_voter(&connection, 10, "A");
    store_voter(&connection, 30, "C");
    let checkpoints = vec![
        BatchCheckpoint {
            batch_id: "batch_1".to_string(),
            batch_number: Some(1),
            last_pk: 10,
        },
        BatchCheckpoint {
            batch_id: "batch_2".to_string(),
            batch_number: Some(2),
            last_pk: 20,
        },
        BatchCheckpoint {
            batch_id: "batch_3".to_string(),
            batch_number: Some(3),
            last_pk: 30,
        },
    ];

    let applied = applied_batch_numbers(&connection, &checkpoints).expect("lookup should run");
    assert_eq!(applied.into_iter().collect::<Vec<_>>(), vec![1, 3]);
}

#[test]
fn default_checkpoints_path_lives_under_manifests() {
    let path = default_checkpoints_path(Path::new("work"));
    assert_eq!(path, Path::new("work/manifests/batch_checkpoints.json"));
}
