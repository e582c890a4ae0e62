use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::cli::{ImportCentersArgs, VotingType};
use crate::mapping::{AliasTable, CenterField};
use crate::model::{
    CenterImportManifest, CenterImportStats, PollingCenterRecord, RecordErrorEntry, RecordKind,
    SourceSummary,
};
use crate::sources::{RecordSource, SourceSpec, open_source};
use crate::store::hierarchy::{
    get_or_create_registration_center, get_or_create_station, upsert_polling_center,
};
use crate::store::{DB_SCHEMA_VERSION, open_store};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

const MAX_REPORTED_ROW_ERRORS: usize = 1_000;

#[derive(Debug, Default, Clone, Copy)]
struct RowOutcome {
    center_created: bool,
    registration_center_created: bool,
    stations_created: u64,
}

pub fn run(args: ImportCentersArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("centers-{}", utc_compact_string(started_ts));
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.work_root.join("voters.sqlite"));

    let aliases = match &args.alias_table {
        Some(path) => AliasTable::from_json_file(path)?,
        None => AliasTable::builtin(),
    };
    let mut spec = SourceSpec::new(args.format, args.input.clone(), RecordKind::PollingCenter);
    spec.sheet = args.sheet.clone();
    spec.skip_rows = args.skip_rows;

    let mut connection = open_store(&db_path)?;
    let source = open_source(&spec)?;
    let source_summary = SourceSummary {
        format: args.format.as_str().to_string(),
        path: args.input.display().to_string(),
        label: source.label.clone(),
        sha256: source.sha256.clone(),
        total_records: source.total,
    };

    let stats = import_centers(
        &mut connection,
        source,
        &aliases,
        args.voting_type,
        args.default_governorate.as_deref(),
    )?;

    let manifest = CenterImportManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        started_at,
        updated_at: now_utc_string(),
        voting_type: args.voting_type.as_str().to_string(),
        source: source_summary,
        stats,
    };
    let report_path = args.report_path.clone().unwrap_or_else(|| {
        args.work_root
            .join("manifests")
            .join(format!("centers_run_{}.json", utc_compact_string(started_ts)))
    });
    write_json_pretty(&report_path, &manifest)?;
    info!(report = %report_path.display(), "center import report written");

    Ok(())
}

/// Upserts every center row inside one transaction. Each row runs under its
/// own savepoint so a failing row is rolled back alone.
pub fn import_centers(
    connection: &mut Connection,
    source: RecordSource,
    aliases: &AliasTable<CenterField>,
    voting_type: VotingType,
    default_governorate: Option<&str>,
) -> Result<CenterImportStats> {
    let now = now_utc_string();
    let mut stats = CenterImportStats::default();
    info!(source = %source.label, voting_type = voting_type.as_str(), "center import started");

    let mut tx = connection
        .transaction()
        .context("failed to open center import transaction")?;
    for item in source.records {
        stats.rows += 1;
        let raw = match item {
            Ok(raw) => raw,
            Err(failure) => {
                note_row_error(&mut stats, failure.location.to_string(), None, failure.error.to_string());
                stats.errored += 1;
                continue;
            }
        };
        if raw.kind != RecordKind::PollingCenter {
            debug!(location = %raw.location, kind = %raw.kind, "non-center record skipped");
            stats.skipped += 1;
            continue;
        }

        let (record, coerced) =
            match PollingCenterRecord::from_mapped(aliases.map(&raw), default_governorate) {
                Ok(parsed) => parsed,
                Err(error) => {
                    if error.is_skip() {
                        stats.skipped += 1;
                    } else {
                        stats.errored += 1;
                    }
                    warn!(location = %raw.location, error = %error, "center row rejected");
                    note_row_error(&mut stats, raw.location.to_string(), None, error.to_string());
                    continue;
                }
            };

        let savepoint = tx.savepoint()?;
        match apply_center_row(&savepoint, &record, voting_type, &now) {
            Ok(outcome) => {
                savepoint
                    .commit()
                    .with_context(|| format!("failed to release savepoint for center {}", record.center_number))?;
                stats.station_counts_coerced += u64::from(coerced);
                if outcome.center_created {
                    stats.centers_created += 1;
                } else {
                    stats.centers_updated += 1;
                }
                stats.registration_centers_created += u64::from(outcome.registration_center_created);
                stats.stations_created += outcome.stations_created;
            }
            Err(err) => {
                drop(savepoint);
                stats.errored += 1;
                warn!(
                    location = %raw.location,
                    center = %record.center_number,
                    error = %format!("{err:#}"),
                    "center row rolled back"
                );
                note_row_error(
                    &mut stats,
                    raw.location.to_string(),
                    Some(record.center_number.clone()),
                    format!("{err:#}"),
                );
            }
        }
    }
    tx.commit().context("failed to commit center import")?;

    info!(
        rows = stats.rows,
        centers_created = stats.centers_created,
        centers_updated = stats.centers_updated,
        registration_centers_created = stats.registration_centers_created,
        stations_created = stats.stations_created,
        station_counts_coerced = stats.station_counts_coerced,
        skipped = stats.skipped,
        errored = stats.errored,
        "center import finished"
    );
    Ok(stats)
}

fn apply_center_row(
    connection: &Connection,
    record: &PollingCenterRecord,
    voting_type: VotingType,
    now: &str,
) -> Result<RowOutcome> {
    let mut outcome = RowOutcome::default();

    let registration_center_id = match &record.registration_center_number {
        Some(number) => {
            let (id, created) = get_or_create_registration_center(
                connection,
                number,
                record.registration_center_name.as_deref(),
                record.governorate.as_deref(),
                now,
            )?;
            outcome.registration_center_created = created;
            Some(id)
        }
        None => None,
    };

    let (center_id, created) = upsert_polling_center(
        connection,
        record,
        voting_type.as_str(),
        registration_center_id,
        now,
    )?;
    outcome.center_created = created;

    for station_number in 1..=record.station_count {
        let (_, created) =
            get_or_create_station(connection, center_id, &record.center_number, station_number, now)?;
        outcome.stations_created += u64::from(created);
    }
    Ok(outcome)
}

fn note_row_error(
    stats: &mut CenterImportStats,
    location: String,
    key: Option<String>,
    message: String,
) {
    if stats.row_errors.len() < MAX_REPORTED_ROW_ERRORS {
        stats.row_errors.push(RecordErrorEntry {
            location,
            key,
            message,
        });
    }
}
