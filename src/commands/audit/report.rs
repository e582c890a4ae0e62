use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use rusqlite::Connection;
use tracing::{debug, warn};

use super::ranges::{compress_ranges, plan_rounds};
use crate::model::{AuditReport, BatchAuditEntry, BatchCheckpoint};
use crate::sources::{BatchFile, list_batch_files, open_json_batch};
use crate::store::count_rows;
use crate::store::voters::voter_id_exists;
use crate::util::{BatchNumberPattern, now_utc_string, read_json};

pub const CHECKPOINTS_FILE_NAME: &str = "batch_checkpoints.json";

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub batch_dir: Option<PathBuf>,
    pub expected_count: Option<u64>,
    pub max_batches_per_round: usize,
}

pub fn default_checkpoints_path(work_root: &Path) -> PathBuf {
    work_root.join("manifests").join(CHECKPOINTS_FILE_NAME)
}

/// Reads `{ "<batch id>": <last pk> }`, ordered by batch number. Ids without a
/// number sort last, by id.
pub fn load_checkpoints(path: &Path) -> Result<Vec<BatchCheckpoint>> {
    if !path.exists() {
        bail!("checkpoint manifest not found: {}", path.display());
    }

    let raw: BTreeMap<String, i64> = read_json(path)?;
    let pattern = BatchNumberPattern::new()?;
    let mut checkpoints: Vec<BatchCheckpoint> = raw
        .into_iter()
        .map(|(batch_id, last_pk)| BatchCheckpoint {
            batch_number: pattern.number(&batch_id),
            batch_id,
            last_pk,
        })
        .collect();
    checkpoints.sort_by(|a, b| {
        a.batch_number
            .unwrap_or(u32::MAX)
            .cmp(&b.batch_number.unwrap_or(u32::MAX))
            .then_with(|| a.batch_id.cmp(&b.batch_id))
    });
    Ok(checkpoints)
}

/// Batch numbers whose last primary key is already stored.
pub fn applied_batch_numbers(
    connection: &Connection,
    checkpoints: &[BatchCheckpoint],
) -> Result<BTreeSet<u32>> {
    let mut applied = BTreeSet::new();
    for checkpoint in checkpoints {
        let Some(number) = checkpoint.batch_number else {
            continue;
        };
        if voter_id_exists(connection, checkpoint.last_pk)? {
            applied.insert(number);
        }
    }
    Ok(applied)
}

/// Classifies every checkpoint as applied or missing. Only reads from the
/// store.
pub fn audit_checkpoints(
    connection: &Connection,
    checkpoints: &[BatchCheckpoint],
    options: &AuditOptions,
) -> Result<AuditReport> {
    let batch_files = match &options.batch_dir {
        Some(dir) => Some(BatchFileIndex::new(list_batch_files(dir)?)),
        None => None,
    };

    let mut entries = Vec::with_capacity(checkpoints.len());
    for checkpoint in checkpoints {
        let applied = voter_id_exists(connection, checkpoint.last_pk)?;
        let record_count = match (&batch_files, applied) {
            (Some(index), false) => index.find(checkpoint).and_then(count_batch_records),
            _ => None,
        };
        debug!(
            batch = %checkpoint.batch_id,
            last_pk = checkpoint.last_pk,
            applied,
            "checkpoint audited"
        );
        entries.push(BatchAuditEntry {
            batch_id: checkpoint.batch_id.clone(),
            batch_number: checkpoint.batch_number,
            last_pk: checkpoint.last_pk,
            applied,
            record_count,
        });
    }

    let (applied, missing): (Vec<&BatchAuditEntry>, Vec<&BatchAuditEntry>) =
        entries.iter().partition(|entry| entry.applied);
    let missing_numbers: Vec<u32> = missing.iter().filter_map(|entry| entry.batch_number).collect();
    let missing_without_batch_file = if batch_files.is_some() {
        missing
            .iter()
            .filter(|entry| entry.record_count.is_none())
            .map(|entry| entry.batch_id.clone())
            .collect()
    } else {
        Vec::new()
    };

    let voters_total = count_rows(connection, "SELECT COUNT(*) FROM voters")?;
    let completion_percent = options
        .expected_count
        .filter(|expected| *expected > 0)
        .map(|expected| voters_total as f64 * 100.0 / expected as f64);

    Ok(AuditReport {
        manifest_version: 1,
        generated_at: now_utc_string(),
        voters_total,
        expected_count: options.expected_count,
        completion_percent,
        applied: applied.iter().map(|entry| entry.batch_id.clone()).collect(),
        missing: missing.iter().map(|entry| entry.batch_id.clone()).collect(),
        applied_ranges: range_summary(&applied),
        missing_ranges: range_summary(&missing),
        missing_record_count: missing.iter().filter_map(|entry| entry.record_count).sum(),
        missing_without_batch_file,
        rounds: plan_rounds(&missing_numbers, options.max_batches_per_round),
        entries,
    })
}

fn range_summary(entries: &[&BatchAuditEntry]) -> String {
    let numbers: Vec<u32> = entries.iter().filter_map(|entry| entry.batch_number).collect();
    let mut parts = Vec::new();
    let ranges = compress_ranges(&numbers);
    if !ranges.is_empty() {
        parts.push(ranges);
    }
    parts.extend(
        entries
            .iter()
            .filter(|entry| entry.batch_number.is_none())
            .map(|entry| entry.batch_id.clone()),
    );
    parts.join(", ")
}

fn count_batch_records(file: &BatchFile) -> Option<u64> {
    match open_json_batch(&file.path) {
        Ok(source) => Some(source.records.count() as u64),
        Err(err) => {
            warn!(file = %file.path.display(), error = %format!("{err:#}"), "batch file unreadable");
            None
        }
    }
}

struct BatchFileIndex {
    by_name: HashMap<String, BatchFile>,
    by_number: HashMap<u32, BatchFile>,
}

impl BatchFileIndex {
    fn new(files: Vec<BatchFile>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_number = HashMap::new();
        for file in files {
            if let Some(stem) = Path::new(&file.name).file_stem() {
                by_name.insert(stem.to_string_lossy().into_owned(), file.clone());
            }
            by_name.insert(file.name.clone(), file.clone());
            by_number.entry(file.number).or_insert(file);
        }
        Self { by_name, by_number }
    }

    fn find(&self, checkpoint: &BatchCheckpoint) -> Option<&BatchFile> {
        self.by_name.get(&checkpoint.batch_id).or_else(|| {
            checkpoint
                .batch_number
                .and_then(|number| self.by_number.get(&number))
        })
    }
}
