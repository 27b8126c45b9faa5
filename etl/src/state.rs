//! Progress counters shared by all workers of a transfer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Counters {
    rows_read: AtomicU64,
    rows_staged: AtomicU64,
    files_written: AtomicU64,
    files_uploaded: AtomicU64,
    load_jobs: AtomicU64,
    rows_loaded: AtomicU64,
}

/// Shared, lock free transfer counters.
///
/// Cloning yields a handle to the same counters. Each counter is only ever incremented.
#[derive(Debug, Clone, Default)]
pub struct TransferState {
    counters: Arc<Counters>,
}

/// Point in time copy of [`TransferState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStateSnapshot {
    pub rows_read: u64,
    pub rows_staged: u64,
    pub files_written: u64,
    pub files_uploaded: u64,
    pub load_jobs: u64,
    pub rows_loaded: u64,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rows_read(&self, rows: u64) {
        self.counters.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_file_written(&self, rows: u64) {
        self.counters.files_written.fetch_add(1, Ordering::Relaxed);
        self.counters.rows_staged.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_file_uploaded(&self) {
        self.counters.files_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_load_job(&self, rows_loaded: u64) {
        self.counters.load_jobs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .rows_loaded
            .fetch_add(rows_loaded, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStateSnapshot {
        let counters = &self.counters;
        TransferStateSnapshot {
            rows_read: counters.rows_read.load(Ordering::Relaxed),
            rows_staged: counters.rows_staged.load(Ordering::Relaxed),
            files_written: counters.files_written.load(Ordering::Relaxed),
            files_uploaded: counters.files_uploaded.load(Ordering::Relaxed),
            load_jobs: counters.load_jobs.load(Ordering::Relaxed),
            rows_loaded: counters.rows_loaded.load(Ordering::Relaxed),
        }
    }
}
