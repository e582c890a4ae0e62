use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::ImportRunManifest;
use crate::store::{count_rows, open_store_read_only};
use crate::util::read_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub voters: i64,
    pub polling_centers: i64,
    pub placeholder_centers: i64,
    pub polling_stations: i64,
    pub registration_centers: i64,
    pub voters_with_unset_refs: i64,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.work_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.work_root.join("voters.sqlite"));

    info!(work_root = %args.work_root.display(), "status requested");

    match latest_import_manifest(&manifest_dir)? {
        Some(path) => {
            let manifest: ImportRunManifest = read_json(&path)?;
            info!(
                run_id = %manifest.run_id,
                status = %manifest.status,
                updated_at = %manifest.updated_at,
                source = %manifest.source.label,
                processed = manifest.stats.processed,
                created = manifest.stats.created,
                errored = manifest.stats.errored,
                failed_batches = manifest.stats.batch_failures.len(),
                "last import run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no import run manifest found"),
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }
    let connection = open_store_read_only(&db_path)?;
    let counts = store_counts(&connection)?;
    let completion_percent = args
        .expected_count
        .filter(|expected| *expected > 0)
        .map(|expected| counts.voters as f64 * 100.0 / expected as f64);

    info!(
        path = %db_path.display(),
        voters = counts.voters,
        polling_centers = counts.polling_centers,
        placeholder_centers = counts.placeholder_centers,
        polling_stations = counts.polling_stations,
        registration_centers = counts.registration_centers,
        voters_with_unset_refs = counts.voters_with_unset_refs,
        completion_percent = %completion_percent.map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}")),
        "database status"
    );
    Ok(())
}

pub fn store_counts(connection: &Connection) -> Result<StoreCounts> {
    Ok(StoreCounts {
        voters: count_rows(connection, "SELECT COUNT(*) FROM voters")?,
        polling_centers: count_rows(connection, "SELECT COUNT(*) FROM polling_centers")?,
        placeholder_centers: count_rows(
            connection,
            "SELECT COUNT(*) FROM polling_centers WHERE is_placeholder = 1",
        )?,
        polling_stations: count_rows(connection, "SELECT COUNT(*) FROM polling_stations")?,
        registration_centers: count_rows(connection, "SELECT COUNT(*) FROM registration_centers")?,
        voters_with_unset_refs: count_rows(
            connection,
            "SELECT COUNT(*) FROM voters
             WHERE polling_center_id IS NULL OR polling_station_id IS NULL
                OR registration_center_id IS NULL",
        )?,
    })
}

/// Manifest names embed a sortable UTC timestamp, so the greatest name is the
/// newest run.
fn latest_import_manifest(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    if !manifest_dir.is_dir() {
        return Ok(None);
    }
    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?
    {
        let path = entry?.path();
        let is_import_run = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("import_run_") && name.ends_with(".json"));
        if is_import_run && latest.as_ref().is_none_or(|current| path > *current) {
            latest = Some(path);
        }
    }
    Ok(latest)
}
