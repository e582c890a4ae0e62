use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use tracing::info;

use super::pipeline::ImportOptions;
use super::progress::{ImportHandle, spawn_import};
use crate::cli::{ImportArgs, SourceFormat};
use crate::commands::audit::{applied_batch_numbers, default_checkpoints_path, load_checkpoints};
use crate::mapping::{AliasTable, FieldFilter};
use crate::model::{
    ImportOptionsSummary, ImportRunManifest, ImportRunStats, RecordKind, SourceSummary,
};
use crate::sources::{SourceSpec, open_source};
use crate::store::{DB_SCHEMA_VERSION, count_rows, open_store};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn run(args: ImportArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("import-{}", utc_compact_string(started_ts));

    let manifest_dir = args.work_root.join("manifests");
    ensure_directory(&manifest_dir)?;
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.work_root.join("voters.sqlite"));

    let filters = args
        .filters
        .iter()
        .map(|raw| raw.parse::<FieldFilter>())
        .collect::<Result<Vec<_>>>()?;
    let options = ImportOptions {
        batch_size: args.batch_size,
        policy: args.policy,
        empty_values: args.empty_values,
        offset: args.offset,
        limit: args.limit,
        filters,
        dry_run: args.dry_run,
    }
    .validated()?;
    let aliases = match &args.alias_table {
        Some(path) => AliasTable::from_json_file(path)?,
        None => AliasTable::builtin(),
    };

    let batch_options_used =
        args.start_batch.is_some() || args.end_batch.is_some() || args.skip_applied;
    if batch_options_used && args.format != SourceFormat::JsonBatchDir {
        bail!("--start-batch, --end-batch and --skip-applied require --format json-batch-dir");
    }

    let mut spec = SourceSpec::new(args.format, args.input.clone(), RecordKind::Voter);
    spec.sheet = args.sheet.clone();
    spec.skip_rows = args.skip_rows;
    spec.table = args.table.clone();
    spec.start_batch = args.start_batch;
    spec.end_batch = args.end_batch;

    let connection = open_store(&db_path)?;
    if args.skip_applied {
        let checkpoints_path = args
            .checkpoints
            .clone()
            .unwrap_or_else(|| default_checkpoints_path(&args.work_root));
        let checkpoints = load_checkpoints(&checkpoints_path)?;
        spec.exclude_batches = applied_batch_numbers(&connection, &checkpoints)?;
        info!(
            checkpoints = %checkpoints_path.display(),
            applied = spec.exclude_batches.len(),
            "skipping batches already present in the store"
        );
    }
    drop(connection);

    let source = open_source(&spec)?;
    let source_summary = SourceSummary {
        format: args.format.as_str().to_string(),
        path: args.input.display().to_string(),
        label: source.label.clone(),
        sha256: source.sha256.clone(),
        total_records: source.total,
    };
    let options_summary = ImportOptionsSummary {
        batch_size: options.batch_size,
        policy: options.policy.as_str().to_string(),
        empty_values: options.empty_values.map(|policy| policy.as_str().to_string()),
        offset: options.offset,
        limit: options.limit,
        filters: options.filters.iter().map(ToString::to_string).collect(),
        dry_run: options.dry_run,
        excluded_batches: spec.exclude_batches.iter().copied().collect(),
    };

    let (handle, worker) = spawn_import(db_path.clone(), source, aliases, options)?;
    wait_for_worker(&handle, &worker, Duration::from_secs(args.heartbeat_secs.max(1)));
    let stats = worker
        .join()
        .map_err(|_| anyhow!("import worker panicked"))??;

    let voters_total = count_rows(&open_store(&db_path)?, "SELECT COUNT(*) FROM voters")?;
    let manifest = ImportRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: run_status(&stats, args.dry_run).to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_import_command(&args),
        source: source_summary,
        options: options_summary,
        stats,
        voters_total,
    };

    let report_path = args.report_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("import_run_{}.json", utc_compact_string(started_ts)))
    });
    write_json_pretty(&report_path, &manifest)?;

    info!(
        status = %manifest.status,
        processed = manifest.stats.processed,
        created = manifest.stats.created,
        updated = manifest.stats.updated,
        skipped = manifest.stats.skipped,
        errored = manifest.stats.errored,
        voters_total,
        report = %report_path.display(),
        "import report written"
    );

    Ok(())
}

fn wait_for_worker<T>(handle: &ImportHandle, worker: &JoinHandle<T>, heartbeat: Duration) {
    let mut last_beat = Instant::now();
    let mut last_processed = 0;
    while !worker.is_finished() {
        thread::sleep(POLL_INTERVAL);
        if last_beat.elapsed() < heartbeat {
            continue;
        }
        let snapshot = handle.snapshot();
        info!(
            batch = snapshot.current_batch,
            processed = snapshot.processed,
            stalled = snapshot.processed == last_processed,
            "import heartbeat"
        );
        last_processed = snapshot.processed;
        last_beat = Instant::now();
    }
}

pub(super) fn run_status(stats: &ImportRunStats, dry_run: bool) -> &'static str {
    if dry_run {
        "dry_run"
    } else if stats.batch_failures.is_empty() && stats.errored == 0 {
        "completed"
    } else {
        "completed_with_errors"
    }
}

pub(super) fn render_import_command(args: &ImportArgs) -> String {
    let mut command = vec![
        "voterload".to_string(),
        "import".to_string(),
        "--work-root".to_string(),
        args.work_root.display().to_string(),
        "--format".to_string(),
        args.format.as_str().to_string(),
        "--input".to_string(),
        args.input.display().to_string(),
    ];

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(sheet) = &args.sheet {
        command.push("--sheet".to_string());
        command.push(sheet.clone());
    }
    if args.skip_rows > 0 {
        command.push("--skip-rows".to_string());
        command.push(args.skip_rows.to_string());
    }
    if let Some(table) = &args.table {
        command.push("--table".to_string());
        command.push(table.clone());
    }
    if let Some(path) = &args.alias_table {
        command.push("--alias-table".to_string());
        command.push(path.display().to_string());
    }
    command.push("--batch-size".to_string());
    command.push(args.batch_size.to_string());
    command.push("--policy".to_string());
    command.push(args.policy.as_str().to_string());
    if let Some(policy) = args.empty_values {
        command.push("--empty-values".to_string());
        command.push(policy.as_str().to_string());
    }
    if args.offset > 0 {
        command.push("--offset".to_string());
        command.push(args.offset.to_string());
    }
    if let Some(limit) = args.limit {
        command.push("--limit".to_string());
        command.push(limit.to_string());
    }
    for filter in &args.filters {
        command.push("--filter".to_string());
        command.push(filter.clone());
    }
    if let Some(start) = args.start_batch {
        command.push("--start-batch".to_string());
        command.push(start.to_string());
    }
    if let Some(end) = args.end_batch {
        command.push("--end-batch".to_string());
        command.push(end.to_string());
    }
    if args.skip_applied {
        command.push("--skip-applied".to_string());
    }
    if let Some(path) = &args.checkpoints {
        command.push("--checkpoints".to_string());
        command.push(path.display().to_string());
    }
    if args.dry_run {
        command.push("--dry-run".to_string());
    }

    command.join(" ")
}
