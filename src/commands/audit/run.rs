use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use super::report::{AuditOptions, audit_checkpoints, default_checkpoints_path, load_checkpoints};
use crate::cli::AuditArgs;
use crate::store::open_store_read_only;
use crate::util::{utc_compact_string, write_json_pretty};

pub fn run(args: AuditArgs) -> Result<()> {
    let started_ts = Utc::now();
    let manifest_dir = args.work_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.work_root.join("voters.sqlite"));
    let checkpoints_path = args
        .checkpoints
        .clone()
        .unwrap_or_else(|| default_checkpoints_path(&args.work_root));

    let checkpoints = load_checkpoints(&checkpoints_path)?;
    let connection = open_store_read_only(&db_path)?;
    info!(
        checkpoints = %checkpoints_path.display(),
        batches = checkpoints.len(),
        db = %db_path.display(),
        "audit started"
    );

    let options = AuditOptions {
        batch_dir: args.batch_dir.clone(),
        expected_count: args.expected_count,
        max_batches_per_round: args.max_batches_per_round,
    };
    let report = audit_checkpoints(&connection, &checkpoints, &options)?;

    info!(
        applied = report.applied.len(),
        missing = report.missing.len(),
        applied_ranges = %report.applied_ranges,
        missing_ranges = %report.missing_ranges,
        missing_records = report.missing_record_count,
        "batch audit"
    );
    info!(
        voters_total = report.voters_total,
        expected = %report.expected_count.map_or_else(|| "n/a".to_string(), |n| n.to_string()),
        completion_percent = %report
            .completion_percent
            .map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}")),
        "store completeness"
    );
    for batch_id in &report.missing_without_batch_file {
        warn!(batch = %batch_id, "missing batch has no readable batch file");
    }
    if let Some(batch_dir) = &args.batch_dir {
        for round in &report.rounds {
            info!(
                round = round.round,
                batches = %round.batches.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
                hint = %format!(
                    "voterload import --format json-batch-dir --input {} --start-batch {} --end-batch {} --skip-applied",
                    batch_dir.display(),
                    round.start_batch,
                    round.end_batch
                ),
                "import round"
            );
        }
    }

    let report_path = args.report_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("audit_{}.json", utc_compact_string(started_ts)))
    });
    write_json_pretty(&report_path, &report)?;
    info!(path = %report_path.display(), "audit report written");

    Ok(())
}
