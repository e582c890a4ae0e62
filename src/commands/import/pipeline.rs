use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Result, bail};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use super::progress::ImportHandle;
use crate::cli::{EmptyValuePolicy, UpsertPolicy};
use crate::mapping::{AliasTable, FieldFilter, VoterField};
use crate::model::{BatchFailure, ImportRunStats, RecordErrorEntry, RecordKind, VoterRecord};
use crate::sources::{RecordFailure, RecordSource};
use crate::store::voters::{InsertOutcome, existing_voter_numbers, insert_voter, update_voter};
use crate::util::now_utc_string;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const MAX_BATCH_SIZE: usize = 30_000;
const MAX_REPORTED_RECORD_ERRORS: usize = 1_000;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub policy: UpsertPolicy,
    pub empty_values: Option<EmptyValuePolicy>,
    pub offset: u64,
    pub limit: Option<u64>,
    pub filters: Vec<FieldFilter>,
    pub dry_run: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            policy: UpsertPolicy::SkipExisting,
            empty_values: None,
            offset: 0,
            limit: None,
            filters: Vec::new(),
            dry_run: false,
        }
    }
}

impl ImportOptions {
    /// Rejects option combinations that would make the run ambiguous and
    /// clamps the batch size into its supported range.
    pub fn validated(mut self) -> Result<Self> {
        if self.policy == UpsertPolicy::UpdateExisting && self.empty_values.is_none() {
            bail!("--policy update-existing requires --empty-values overwrite|preserve");
        }
        if self.policy == UpsertPolicy::SkipExisting && self.empty_values.is_some() {
            bail!("--empty-values only applies to --policy update-existing");
        }
        let clamped = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        if clamped != self.batch_size {
            warn!(
                requested = self.batch_size,
                batch_size = clamped,
                "batch size clamped"
            );
            self.batch_size = clamped;
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchOutcome {
    created: u64,
    updated: u64,
    skipped: u64,
    conflicts: u64,
    pk_reassigned: u64,
}

/// Streams the source through the mapper into batched upserts. Record and
/// batch failures are counted and reported; only store setup errors abort.
pub fn run_pipeline(
    connection: &mut Connection,
    source: RecordSource,
    aliases: &AliasTable<VoterField>,
    options: &ImportOptions,
    handle: &ImportHandle,
) -> Result<ImportRunStats> {
    let started = Instant::now();
    let total = source.total.map(|total| {
        let remaining = total.saturating_sub(options.offset);
        options.limit.map_or(remaining, |limit| remaining.min(limit))
    });
    handle.begin(total);
    info!(
        source = %source.label,
        total = %count_label(total),
        batch_size = options.batch_size,
        policy = options.policy.as_str(),
        dry_run = options.dry_run,
        "import started"
    );

    let mut stats = ImportRunStats::default();
    let mut pending: Vec<VoterRecord> = Vec::with_capacity(options.batch_size);
    let mut planned: HashSet<String> = HashSet::new();
    let records = source
        .records
        .skip(usize::try_from(options.offset).unwrap_or(usize::MAX))
        .take(usize::try_from(options.limit.unwrap_or(u64::MAX)).unwrap_or(usize::MAX));

    for item in records {
        stats.processed += 1;
        let raw = match item {
            Ok(raw) => raw,
            Err(failure) => {
                note_record_failure(&mut stats, &failure, None);
                continue;
            }
        };
        if raw.kind != RecordKind::Voter {
            debug!(location = %raw.location, kind = %raw.kind, "non-voter record skipped");
            stats.skipped += 1;
            continue;
        }

        let mapped = aliases.map(&raw);
        let key = mapped.get(VoterField::VoterNumber).map(str::to_string);
        let voter = match VoterRecord::from_mapped(mapped, raw.source_pk) {
            Ok(voter) => voter,
            Err(error) => {
                let failure = RecordFailure {
                    location: raw.location,
                    error,
                };
                note_record_failure(&mut stats, &failure, key.as_deref());
                continue;
            }
        };
        if !options.filters.iter().all(|filter| filter.matches(&voter)) {
            stats.filtered_out += 1;
            continue;
        }

        pending.push(voter);
        if pending.len() >= options.batch_size {
            flush_batch(connection, &mut pending, &mut planned, options, &mut stats, total, started, handle);
        }
    }
    if !pending.is_empty() {
        flush_batch(connection, &mut pending, &mut planned, options, &mut stats, total, started, handle);
    }

    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    handle.publish(stats.batches, &stats);
    handle.finish();
    info!(
        processed = stats.processed,
        created = stats.created,
        updated = stats.updated,
        skipped = stats.skipped,
        errored = stats.errored,
        filtered_out = stats.filtered_out,
        pk_reassigned = stats.pk_reassigned,
        failed_batches = stats.batch_failures.len(),
        elapsed_ms = stats.elapsed_ms,
        "import finished"
    );
    Ok(stats)
}

fn note_record_failure(stats: &mut ImportRunStats, failure: &RecordFailure, key: Option<&str>) {
    if failure.error.is_skip() {
        stats.skipped += 1;
        stats.missing_key += 1;
    } else {
        stats.errored += 1;
    }
    warn!(
        location = %failure.location,
        voter_number = key.unwrap_or(""),
        error = %failure.error,
        "record rejected"
    );

    if stats.record_errors.len() < MAX_REPORTED_RECORD_ERRORS {
        stats.record_errors.push(RecordErrorEntry {
            location: failure.location.to_string(),
            key: key.map(str::to_string),
            message: failure.error.to_string(),
        });
    } else {
        stats.record_errors_truncated = true;
    }
}

#[allow(clippy::too_many_arguments)]
fn flush_batch(
    connection: &mut Connection,
    pending: &mut Vec<VoterRecord>,
    planned: &mut HashSet<String>,
    options: &ImportOptions,
    stats: &mut ImportRunStats,
    total: Option<u64>,
    started: Instant,
    handle: &ImportHandle,
) {
    stats.batches += 1;
    let batch_number = stats.batches;
    let batch: Vec<VoterRecord> = std::mem::take(pending);
    let batch_started = Instant::now();

    let outcome = apply_batch(connection, &batch, planned, options, batch_number);
    let batch_ms = batch_started.elapsed().as_millis() as u64;
    let committed = outcome.is_ok();
    match outcome {
        Ok(outcome) => {
            stats.created += outcome.created;
            stats.updated += outcome.updated;
            stats.skipped += outcome.skipped + outcome.conflicts;
            stats.conflicts_absorbed += outcome.conflicts;
            stats.pk_reassigned += outcome.pk_reassigned;
        }
        Err(failure) => {
            stats.errored += batch.len() as u64;
            error!(
                batch = failure.batch_number,
                records = failure.record_count,
                first_key = failure.first_key.as_deref().unwrap_or(""),
                last_key = failure.last_key.as_deref().unwrap_or(""),
                offending_key = failure.offending_key.as_deref().unwrap_or(""),
                error = %failure.message,
                "batch rolled back"
            );
            stats.batch_failures.push(failure);
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    let rate = if elapsed_secs > 0.0 {
        stats.processed as f64 / elapsed_secs
    } else {
        0.0
    };
    let percent = total
        .filter(|total| *total > 0)
        .map(|total| stats.processed as f64 * 100.0 / total as f64);
    let eta_secs = total
        .filter(|_| rate > 0.0)
        .map(|total| (total.saturating_sub(stats.processed) as f64 / rate).round() as u64);

    info!(
        batch = batch_number,
        committed,
        dry_run = options.dry_run,
        processed = stats.processed,
        total = %count_label(total),
        percent = %percent.map_or_else(|| "n/a".to_string(), |p| format!("{p:.1}")),
        created = stats.created,
        updated = stats.updated,
        skipped = stats.skipped,
        errored = stats.errored,
        batch_ms,
        eta_secs = %eta_secs.map_or_else(|| "n/a".to_string(), |s| s.to_string()),
        "batch processed"
    );

    handle.publish(batch_number, stats);
    handle.push_log(format!(
        "batch {batch_number}: processed={} created={} updated={} skipped={} errored={} ({batch_ms} ms){}",
        stats.processed,
        stats.created,
        stats.updated,
        stats.skipped,
        stats.errored,
        if committed { "" } else { " ROLLED BACK" }
    ));
}

fn count_label(count: Option<u64>) -> String {
    count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
}

/// One transaction per batch: a single existence lookup, inserts for new keys,
/// one update per existing key when the policy allows it. A dry run records
/// the keys it would have created in `planned` so later batches see them.
fn apply_batch(
    connection: &mut Connection,
    batch: &[VoterRecord],
    planned: &mut HashSet<String>,
    options: &ImportOptions,
    batch_number: u64,
) -> std::result::Result<BatchOutcome, BatchFailure> {
    let failure = |offending: Option<&str>, err: anyhow::Error| BatchFailure {
        batch_number,
        record_count: batch.len(),
        first_key: batch.first().map(|voter| voter.voter_number.clone()),
        last_key: batch.last().map(|voter| voter.voter_number.clone()),
        offending_key: offending.map(str::to_string),
        message: format!("{err:#}"),
    };

    let keys: Vec<&str> = batch.iter().map(|voter| voter.voter_number.as_str()).collect();
    let existing = existing_voter_numbers(connection, &keys).map_err(|err| failure(None, err))?;
    let (known, fresh): (Vec<&VoterRecord>, Vec<&VoterRecord>) = batch
        .iter()
        .partition(|voter| existing.contains(&voter.voter_number));

    let mut outcome = BatchOutcome::default();
    let update = options.policy == UpsertPolicy::UpdateExisting;

    if options.dry_run {
        let (carried, fresh): (Vec<&VoterRecord>, Vec<&VoterRecord>) = fresh
            .into_iter()
            .partition(|voter| planned.contains(&voter.voter_number));
        let mut seen = HashSet::with_capacity(fresh.len());
        for voter in &fresh {
            if seen.insert(voter.voter_number.as_str()) {
                outcome.created += 1;
            } else {
                outcome.conflicts += 1;
            }
        }
        let known = (known.len() + carried.len()) as u64;
        if update {
            outcome.updated = known;
        } else {
            outcome.skipped = known;
        }
        planned.extend(seen.into_iter().map(str::to_string));
        return Ok(outcome);
    }

    let empty_values = options.empty_values.unwrap_or(EmptyValuePolicy::Preserve);
    let now = now_utc_string();
    let tx = connection
        .transaction()
        .map_err(|err| failure(None, err.into()))?;

    for voter in &fresh {
        let inserted = insert_voter(&tx, voter, &now)
            .map_err(|err| failure(Some(&voter.voter_number), err))?;
        match inserted {
            InsertOutcome::Inserted => outcome.created += 1,
            InsertOutcome::ReassignedId => {
                warn!(
                    voter_number = %voter.voter_number,
                    source_pk = voter.source_pk.unwrap_or_default(),
                    "source primary key already taken, voter stored under a new id"
                );
                outcome.created += 1;
                outcome.pk_reassigned += 1;
            }
            InsertOutcome::Absorbed => {
                debug!(voter_number = %voter.voter_number, "duplicate key absorbed");
                outcome.conflicts += 1;
            }
        }
    }

    for voter in &known {
        if !update {
            outcome.skipped += 1;
            continue;
        }
        update_voter(&tx, voter, empty_values, &now)
            .map_err(|err| failure(Some(&voter.voter_number), err))?;
        outcome.updated += 1;
    }

    tx.commit().map_err(|err| failure(None, err.into()))?;
    Ok(outcome)
}
