use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use super::pipeline::{ImportOptions, run_pipeline};
use crate::mapping::{AliasTable, VoterField};
use crate::model::ImportRunStats;
use crate::sources::RecordSource;
use crate::store::open_store;

pub const LOG_CAPACITY: usize = 200;
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Shared view of one import run. Cloning shares the same counters.
#[derive(Debug, Clone, Default)]
pub struct ImportHandle {
    inner: Arc<HandleState>,
}

#[derive(Debug)]
struct HandleState {
    running: AtomicBool,
    total: AtomicU64,
    processed: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    current_batch: AtomicU64,
    log: Mutex<VecDeque<String>>,
}

impl Default for HandleState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            processed: AtomicU64::new(0),
            created: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            current_batch: AtomicU64::new(0),
            log: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub running: bool,
    pub total: Option<u64>,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
    pub current_batch: u64,
    pub log: Vec<String>,
}

impl ImportHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self, total: Option<u64>) {
        self.inner
            .total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
        self.inner.running.store(true, Ordering::Release);
    }

    pub(crate) fn publish(&self, batch: u64, stats: &ImportRunStats) {
        let state = &self.inner;
        state.current_batch.store(batch, Ordering::Relaxed);
        state.processed.store(stats.processed, Ordering::Relaxed);
        state.created.store(stats.created, Ordering::Relaxed);
        state.updated.store(stats.updated, Ordering::Relaxed);
        state.skipped.store(stats.skipped, Ordering::Relaxed);
        state.errored.store(stats.errored, Ordering::Relaxed);
    }

    pub(crate) fn push_log(&self, line: impl Into<String>) {
        let mut log = self.inner.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() == LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(line.into());
    }

    pub(crate) fn finish(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = &self.inner;
        let total = state.total.load(Ordering::Relaxed);
        let log = state
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        ProgressSnapshot {
            running: state.running.load(Ordering::Acquire),
            total: (total != UNKNOWN_TOTAL).then_some(total),
            processed: state.processed.load(Ordering::Relaxed),
            created: state.created.load(Ordering::Relaxed),
            updated: state.updated.load(Ordering::Relaxed),
            skipped: state.skipped.load(Ordering::Relaxed),
            errored: state.errored.load(Ordering::Relaxed),
            current_batch: state.current_batch.load(Ordering::Relaxed),
            log,
        }
    }
}

/// Runs an import on a worker thread. The store is opened inside the worker;
/// callers poll the returned handle and join for the final stats.
pub fn spawn_import(
    db_path: PathBuf,
    source: RecordSource,
    aliases: AliasTable<VoterField>,
    options: ImportOptions,
) -> Result<(ImportHandle, JoinHandle<Result<ImportRunStats>>)> {
    let handle = ImportHandle::new();
    handle.begin(source.total);
    let worker_handle = handle.clone();

    let join = thread::Builder::new()
        .name("voter-import".to_string())
        .spawn(move || {
            let result = open_store(&db_path).and_then(|mut connection| {
                run_pipeline(&mut connection, source, &aliases, &options, &worker_handle)
            });
            worker_handle.finish();
            result
        })
        .context("failed to spawn import worker")?;

    Ok((handle, join))
}
