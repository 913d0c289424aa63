//! Per-table ingestion state and the active/idle registry.
//!
//! A `TableUpdateDetails` is shared-owned by the catalog; I/O workers and
//! writer threads hold clones. A table sits in exactly one of the two
//! catalog maps, guarded by a single read/write lock on the scheduler: the
//! hot path takes the read lock, transitions take the write lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::table::Engine;
use crate::writer::TableWriter;

pub fn millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Writer-thread-owned part of the table state: the open writer handle and
/// the uncommitted row counter. Only the owning writer thread locks this on
/// the hot path; the mutex is effectively uncontended.
#[derive(Default)]
pub struct WriterSlot {
    pub writer: Option<TableWriter>,
    pub n_uncommitted: u32,
}

impl WriterSlot {
    /// Open the writer lazily under the pipeline's standing reservation.
    pub fn open(&mut self, engine: &Arc<Engine>, name: &str) -> anyhow::Result<&mut TableWriter> {
        if self.writer.is_none() {
            self.writer = Some(engine.open_reserved_writer(name)?);
        }
        Ok(self.writer.as_mut().unwrap())
    }
}

pub struct TableUpdateDetails {
    name: String,
    table_dir: PathBuf,
    /// Owning writer thread. Mutated only by the scheduler under the catalog
    /// write lock, or by the "from" writer during the rebalance handshake.
    writer_thread_id: AtomicI32,
    /// Updates since the last load rebalance. Incremented by multiple I/O
    /// workers without synchronisation; the rebalancer consumes the
    /// approximate value on purpose.
    n_updates: AtomicU32,
    last_line_epoch_ms: AtomicI64,
    n_io_workers: AtomicI32,
    assigned_to_job: AtomicBool,
    /// Whether the ingestion pipeline holds the engine's writer reservation.
    reserved: AtomicBool,
    slot: Mutex<WriterSlot>,
}

impl TableUpdateDetails {
    pub fn new(name: String, table_dir: PathBuf, writer_thread_id: i32) -> Arc<Self> {
        Arc::new(Self {
            name,
            table_dir,
            writer_thread_id: AtomicI32::new(writer_thread_id),
            n_updates: AtomicU32::new(0),
            last_line_epoch_ms: AtomicI64::new(i64::MAX),
            n_io_workers: AtomicI32::new(0),
            assigned_to_job: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            slot: Mutex::new(WriterSlot::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_dir(&self) -> &std::path::Path {
        &self.table_dir
    }

    pub fn writer_thread_id(&self) -> i32 {
        self.writer_thread_id.load(Ordering::Acquire)
    }

    pub fn set_writer_thread_id(&self, id: i32) {
        self.writer_thread_id.store(id, Ordering::Release);
    }

    pub fn bump_updates(&self) -> u32 {
        self.n_updates.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn n_updates(&self) -> u32 {
        self.n_updates.load(Ordering::Relaxed)
    }

    pub fn reset_updates(&self) {
        self.n_updates.store(0, Ordering::Relaxed);
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_line_epoch_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_line_epoch_ms(&self) -> i64 {
        self.last_line_epoch_ms.load(Ordering::Relaxed)
    }

    pub fn io_worker_added(&self) -> i32 {
        self.n_io_workers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn io_worker_removed(&self) -> i32 {
        self.n_io_workers.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn n_io_workers(&self) -> i32 {
        self.n_io_workers.load(Ordering::Relaxed)
    }

    pub fn assigned_to_job(&self) -> bool {
        self.assigned_to_job.load(Ordering::Relaxed)
    }

    pub fn set_assigned_to_job(&self, assigned: bool) {
        self.assigned_to_job.store(assigned, Ordering::Relaxed);
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::Release);
    }

    pub fn writer_slot(&self) -> &Mutex<WriterSlot> {
        &self.slot
    }

    /// Commit anything pending and close the writer handle. Used for idle
    /// release, shutdown, and the "from" side of a rebalance.
    pub fn commit_and_close(&self, commit_hysteresis_us: i64) {
        let mut slot = self.slot.lock().unwrap();
        if let Some(mut writer) = slot.writer.take() {
            if slot.n_uncommitted > 0 || commit_hysteresis_us > 0 {
                if let Err(err) = writer.commit() {
                    tracing::error!(
                        table = %self.name,
                        error = %format!("{err:#}"),
                        "commit on close failed"
                    );
                }
            }
            slot.n_uncommitted = 0;
        }
    }

    /// Hand the table over during a rebalance: flush, close, and drop the
    /// job assignment so the next owner re-registers it.
    pub fn switch_threads(&self, commit_hysteresis_us: i64) {
        self.set_assigned_to_job(false);
        self.commit_and_close(commit_hysteresis_us);
    }
}

impl std::fmt::Debug for TableUpdateDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableUpdateDetails")
            .field("name", &self.name)
            .field("writer_thread_id", &self.writer_thread_id())
            .finish()
    }
}

/// The two-map table registry. A table name appears in exactly one map.
#[derive(Debug, Default)]
pub struct Catalog {
    pub active: HashMap<String, Arc<TableUpdateDetails>>,
    pub idle: HashMap<String, Arc<TableUpdateDetails>>,
}
