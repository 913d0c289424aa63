//! The ingestion scheduler: routes parsed measurements onto the dispatch
//! queue with per-table writer-thread affinity, creates tables on first
//! contact, and rebalances hot tables between writer threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::catalog::{millis_now, Catalog, TableUpdateDetails};
use crate::event;
use crate::line::ParsedLine;
use crate::queue::{DispatchQueue, PubNext};
use crate::symbol::{IoLocalTable, SymbolCache};
use crate::table::{
    default_column_type, Engine, PartitionBy, TableStatus, TableStructure,
};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Slots in the writer dispatch ring (rounded up to a power of two).
    pub writer_queue_capacity: usize,
    /// Upper bound on one wire line, which also sizes the event buffers.
    pub max_measurement_size: usize,
    /// Per-table update count that triggers a load-rebalance attempt.
    pub n_updates_per_load_rebalance: u32,
    /// Hottest/coolest writer load ratio that justifies moving a table.
    pub max_load_ratio: f64,
    /// Rows a writer buffers per table before committing.
    pub max_uncommitted_rows: u32,
    pub maintenance_interval_ms: i64,
    /// Quiet time after which a table's writer is released to the idle pool.
    pub min_idle_ms_before_writer_release: i64,
    pub commit_hysteresis_us: i64,
    pub default_partition_by: PartitionBy,
    pub default_symbol_cache: bool,
    pub default_symbol_capacity: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            writer_queue_capacity: 128,
            max_measurement_size: 2048,
            n_updates_per_load_rebalance: 1024,
            max_load_ratio: 1.9,
            max_uncommitted_rows: 1000,
            maintenance_interval_ms: 1000,
            min_idle_ms_before_writer_release: 30_000,
            commit_hysteresis_us: 0,
            default_partition_by: PartitionBy::Day,
            default_symbol_cache: true,
            default_symbol_capacity: 256,
        }
    }
}

/// Per-I/O-worker scheduler state: the non-owning local table cache and the
/// worker's pool of reusable symbol caches.
pub struct IoWorkerState {
    worker_id: usize,
    local: HashMap<String, LocalEntry>,
    unused_symbol_caches: Vec<SymbolCache>,
}

struct LocalEntry {
    table: Arc<TableUpdateDetails>,
    details: IoLocalTable,
}

impl IoWorkerState {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            local: HashMap::new(),
            unused_symbol_caches: Vec::new(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn cached_tables(&self) -> usize {
        self.local.len()
    }

    fn drop_local(&mut self, name: &str) {
        if let Some(mut entry) = self.local.remove(name) {
            entry.details.clear(&mut self.unused_symbol_caches);
            let left = entry.table.io_worker_removed();
            tracing::info!(
                worker = self.worker_id,
                table = %name,
                io_workers = left,
                "network IO thread released table"
            );
        }
    }
}

enum Resolved {
    Table,
    /// Writer held elsewhere; retryable.
    Busy,
    /// Table cannot exist (creation failed); line is consumed and dropped.
    Dropped,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    cfg: SchedulerConfig,
    queue: Arc<DispatchQueue>,
    catalog: RwLock<Catalog>,
    n_writers: usize,
    closed: AtomicBool,
    n_load_check_cycles: AtomicU64,
    n_rebalances: AtomicU64,
    rows_published: AtomicU64,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, cfg: SchedulerConfig, n_writers: usize) -> Arc<Self> {
        let queue = DispatchQueue::new(
            cfg.writer_queue_capacity,
            event::buf_capacity(cfg.max_measurement_size),
            n_writers,
        );
        Arc::new(Self {
            engine,
            cfg,
            queue,
            catalog: RwLock::new(Catalog::default()),
            n_writers: n_writers.max(1),
            closed: AtomicBool::new(false),
            n_load_check_cycles: AtomicU64::new(0),
            n_rebalances: AtomicU64::new(0),
            rows_published: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn n_writers(&self) -> usize {
        self.n_writers
    }

    pub(crate) fn catalog(&self) -> &RwLock<Catalog> {
        &self.catalog
    }

    pub fn rows_published(&self) -> u64 {
        self.rows_published.load(Ordering::Relaxed)
    }

    pub fn n_rebalances(&self) -> u64 {
        self.n_rebalances.load(Ordering::Relaxed)
    }

    pub fn n_load_check_cycles(&self) -> u64 {
        self.n_load_check_cycles.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// (active, idle) table counts.
    pub fn table_counts(&self) -> (usize, usize) {
        let catalog = self.catalog.read().unwrap();
        (catalog.active.len(), catalog.idle.len())
    }

    pub fn is_table_active(&self, name: &str) -> bool {
        self.catalog.read().unwrap().active.contains_key(name)
    }

    pub fn is_table_idle(&self, name: &str) -> bool {
        self.catalog.read().unwrap().idle.contains_key(name)
    }

    /// Current writer-thread assignment of a known table.
    pub fn writer_thread_of(&self, name: &str) -> Option<i32> {
        let catalog = self.catalog.read().unwrap();
        catalog
            .active
            .get(name)
            .or_else(|| catalog.idle.get(name))
            .map(|t| t.writer_thread_id())
    }

    /// Serialize one parsed line into the dispatch queue.
    ///
    /// Returns `false` when the caller must retry later: the queue is full,
    /// or the table's writer is locked elsewhere. Returns `true` when the
    /// line was consumed, including the case where it was dropped because
    /// the table could not be created.
    pub fn try_commit_row(&self, state: &mut IoWorkerState, line: &ParsedLine<'_>) -> bool {
        if self.is_closed() {
            return true;
        }
        match self.resolve_table(state, line) {
            Resolved::Busy => return false,
            Resolved::Dropped => return true,
            Resolved::Table => {}
        }

        let seq = loop {
            match self.queue.next_pub() {
                PubNext::Slot(seq) => break seq,
                PubNext::Contended => {
                    std::hint::spin_loop();
                    continue;
                }
                PubNext::Full => return false,
            }
        };

        let entry = state.local.get_mut(&*line.measurement).unwrap();
        let table = Arc::clone(&entry.table);
        {
            // SAFETY: we hold the publisher claim for `seq`; the slot is
            // invisible to consumers until `publish`.
            let event = unsafe { self.queue.event_mut(seq) };
            event.create_row(
                &self.engine,
                &table,
                line,
                &mut entry.details,
                &mut state.unused_symbol_caches,
            );
        }
        self.queue.publish(seq);
        self.rows_published.fetch_add(1, Ordering::Relaxed);

        if table.bump_updates() > self.cfg.n_updates_per_load_rebalance {
            if let Ok(mut catalog) = self.catalog.try_write() {
                self.load_rebalance(&mut catalog);
            }
        }
        true
    }

    /// Find the table in the worker's local cache, the catalog, or create it.
    fn resolve_table(&self, state: &mut IoWorkerState, line: &ParsedLine<'_>) -> Resolved {
        let name: &str = &line.measurement;
        let now_ms = millis_now();
        if let Some(entry) = state.local.get(name) {
            entry.table.touch(now_ms);
            return Resolved::Table;
        }

        let mut catalog = self.catalog.write().unwrap();
        let table = if let Some(table) = catalog.active.get(name) {
            Arc::clone(table)
        } else if let Some(table) = catalog.idle.get(name).cloned() {
            if !table.is_reserved() {
                if !self.engine.try_reserve_writer(name) {
                    tracing::info!(table = %name, "could not get table writer");
                    return Resolved::Busy;
                }
                table.set_reserved(true);
            }
            catalog.idle.remove(name);
            catalog.active.insert(name.to_string(), Arc::clone(&table));
            tracing::info!(table = %name, "idle table going active");
            table
        } else {
            if self.engine.status(name) != TableStatus::Exists {
                if let Err(err) = self.engine.create_table(&self.structure_for(line)) {
                    tracing::info!(
                        table = %name,
                        error = %format!("{err:#}"),
                        "could not create table"
                    );
                    return Resolved::Dropped;
                }
            }
            if !self.engine.try_reserve_writer(name) {
                tracing::info!(table = %name, "could not get table writer");
                return Resolved::Busy;
            }
            let thread_id = self.least_loaded_thread(&catalog);
            let table = TableUpdateDetails::new(
                name.to_string(),
                self.engine.table_dir(name),
                thread_id,
            );
            table.set_reserved(true);
            catalog.active.insert(name.to_string(), Arc::clone(&table));
            tracing::info!(table = %name, thread = thread_id, "assigned table to thread");
            table
        };
        drop(catalog);

        table.touch(now_ms);
        let io_workers = table.io_worker_added();
        tracing::info!(
            worker = state.worker_id,
            table = %name,
            io_workers,
            "network IO thread using table"
        );
        state.local.insert(
            name.to_string(),
            LocalEntry {
                table,
                details: IoLocalTable::default(),
            },
        );
        Resolved::Table
    }

    /// Table shape derived from the first line seen for it.
    fn structure_for(&self, line: &ParsedLine<'_>) -> TableStructure {
        TableStructure {
            name: line.measurement.to_string(),
            columns: line
                .entities
                .iter()
                .map(|e| {
                    (
                        e.name.to_string(),
                        default_column_type(e.value.entity_type()),
                    )
                })
                .collect(),
            partition_by: self.cfg.default_partition_by,
            symbol_cache: self.cfg.default_symbol_cache,
            symbol_capacity: self.cfg.default_symbol_capacity,
        }
    }

    fn thread_loads(&self, catalog: &Catalog) -> Vec<u64> {
        let mut loads = vec![0u64; self.n_writers];
        for table in catalog.active.values() {
            let id = table.writer_thread_id();
            if id >= 0 && (id as usize) < loads.len() {
                loads[id as usize] += table.n_updates() as u64;
            }
        }
        loads
    }

    fn least_loaded_thread(&self, catalog: &Catalog) -> i32 {
        let loads = self.thread_loads(catalog);
        loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(id, _)| id as i32)
            .unwrap_or(0)
    }

    /// Move one table from the hottest writer thread to the coolest, when
    /// the load ratio justifies it. Runs under the catalog write lock.
    pub(crate) fn load_rebalance(&self, catalog: &mut Catalog) {
        let cycle = self.n_load_check_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(cycle, "load check");
        let loads = self.thread_loads(catalog);

        let mut max_load = u64::MAX;
        let mut plan: Option<(i32, i32, Arc<TableUpdateDetails>)> = None;
        loop {
            let mut highest = 0u64;
            let mut highest_id: i32 = -1;
            let mut lowest = u64::MAX;
            let mut lowest_id: i32 = -1;
            for (id, &load) in loads.iter().enumerate() {
                if load >= max_load {
                    continue;
                }
                if highest_id == -1 || load > highest {
                    highest = load;
                    highest_id = id as i32;
                }
                if load < lowest {
                    lowest = load;
                    lowest_id = id as i32;
                }
            }
            if highest_id == -1 || lowest_id == -1 || highest_id == lowest_id {
                break;
            }
            let ratio = highest as f64 / lowest as f64;
            if ratio < self.cfg.max_load_ratio {
                // Load is not sufficiently unbalanced.
                break;
            }

            let mut n_tables = 0;
            let mut least: Option<&Arc<TableUpdateDetails>> = None;
            let mut least_updates = u32::MAX;
            for table in catalog.active.values() {
                if table.writer_thread_id() == highest_id && table.n_updates() > 0 {
                    n_tables += 1;
                    if table.n_updates() < least_updates {
                        least_updates = table.n_updates();
                        least = Some(table);
                    }
                }
            }
            if n_tables < 2 {
                // The hottest thread carries a single loaded table; look for
                // the next-hottest candidate instead.
                max_load = highest;
                continue;
            }
            plan = least.map(|t| (highest_id, lowest_id, Arc::clone(t)));
            break;
        }

        // Stale history must not drive the next cycle.
        for table in catalog.active.values() {
            table.reset_updates();
        }

        let Some((from, to, table)) = plan else {
            return;
        };
        let Some(seq) = self.next_pub_spin() else {
            return;
        };
        {
            // SAFETY: publisher claim held, slot unpublished.
            let event = unsafe { self.queue.event_mut(seq) };
            event.create_rebalance(from, to, &table);
        }
        table.set_writer_thread_id(to);
        let n = self.n_rebalances.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            cycle,
            rebalances = n,
            table = %table.name(),
            from,
            to,
            "rebalance cycle, requesting table move"
        );
        self.queue.publish(seq);
    }

    /// Claim a publisher slot, spinning through contention. `None` means the
    /// queue is full or the scheduler is closed.
    fn next_pub_spin(&self) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        loop {
            match self.queue.next_pub() {
                PubNext::Slot(seq) => return Some(seq),
                PubNext::Contended => std::hint::spin_loop(),
                PubNext::Full => return None,
            }
        }
    }

    /// Release one idle table for this worker, if any. Called from the I/O
    /// worker's maintenance tick; at most one release per call bounds the
    /// latency impact.
    pub fn run_idle_maintenance(&self, state: &mut IoWorkerState, now_ms: i64) -> bool {
        let min_idle = self.cfg.min_idle_ms_before_writer_release;
        let candidate = state
            .local
            .iter()
            .find(|(_, e)| now_ms - e.table.last_line_epoch_ms() >= min_idle)
            .map(|(name, e)| (name.clone(), Arc::clone(&e.table)));
        let Some((name, table)) = candidate else {
            return false;
        };

        let mut catalog = self.catalog.write().unwrap();
        if table.n_io_workers() == 1 {
            let Some(seq) = self.next_pub_spin() else {
                return true;
            };
            {
                // SAFETY: publisher claim held, slot unpublished.
                let event = unsafe { self.queue.event_mut(seq) };
                event.create_release_writer(&table);
            }
            state.drop_local(&name);
            catalog.active.remove(&name);
            catalog.idle.insert(name.clone(), table);
            self.queue.publish(seq);
            tracing::info!(table = %name, "table went idle, requesting writer release");
            true
        } else {
            state.drop_local(&name);
            state.cached_tables() > 0
        }
    }

    /// Refuse further publishes and close every table not owned by a writer
    /// job. Writer jobs close their assigned tables when their pool drains.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.catalog.write().unwrap();
        let catalog = &mut *guard;
        let tables: Vec<Arc<TableUpdateDetails>> = catalog
            .active
            .drain()
            .chain(catalog.idle.drain())
            .map(|(_, t)| t)
            .collect();
        for table in tables {
            if !table.assigned_to_job() {
                table.commit_and_close(self.cfg.commit_hysteresis_us);
            }
            if table.is_reserved() {
                self.engine.release_writer_reservation(table.name());
                table.set_reserved(false);
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("n_writers", &self.n_writers)
            .field("closed", &self.is_closed())
            .finish()
    }
}
