//! strata: a columnar time-series ingestion engine.
//!
//! The core is a multi-threaded ingestion scheduler: network I/O workers
//! parse line-protocol measurements and publish them onto a multi-producer
//! dispatch ring; writer threads with strict per-table affinity drain the
//! ring into per-table column writers; a load rebalancer migrates hot tables
//! between writer threads; and out-of-order commits are rewritten through a
//! partition merge planner backed by a copy worker pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub mod catalog;
pub mod copy;
pub mod event;
pub mod fileio;
pub mod io_job;
pub mod line;
pub mod ooo;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod symbol;
pub mod table;
pub mod writer;
pub mod writer_job;

pub use catalog::TableUpdateDetails;
pub use copy::{copy_queue, CopyJob, CopyPublisher};
pub use io_job::{ConnDispatcher, NetworkIoJob};
pub use line::{LineParser, ParsedLine, TimestampUnit};
pub use pool::{Job, WorkerPool};
pub use scheduler::{IoWorkerState, Scheduler, SchedulerConfig};
pub use table::{ColumnData, ColumnType, Engine, PartitionBy, TableStructure};
pub use writer::TableWriter;
pub use writer_job::WriterJob;

/// Configuration for running an ingestion node, embedded or standalone.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_ilp: SocketAddr,
    pub data_dir: PathBuf,
    pub io_workers: usize,
    pub writer_workers: usize,
    pub copy_workers: usize,
    pub copy_queue_capacity: usize,
    pub timestamp_unit: TimestampUnit,
    pub scheduler: SchedulerConfig,
}

impl NodeConfig {
    pub fn new(listen_ilp: SocketAddr, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_ilp,
            data_dir: data_dir.into(),
            io_workers: 2,
            writer_workers: 2,
            copy_workers: 2,
            copy_queue_capacity: 64,
            timestamp_unit: TimestampUnit::Nanos,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// A running ingestion node: the engine, the scheduler, and three worker
/// pools (network I/O, table writers, out-of-order copies).
pub struct Node {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<ConnDispatcher>,
    io_pool: Option<WorkerPool>,
    writer_pool: Option<WorkerPool>,
    copy_pool: Option<WorkerPool>,
}

/// Wire up and start an ingestion node.
pub fn start_node(cfg: NodeConfig) -> anyhow::Result<Node> {
    let (copy_publisher, copy_rx) = copy::copy_queue(cfg.copy_queue_capacity);
    let engine = Engine::open(&cfg.data_dir, copy_publisher)?;
    let scheduler = Scheduler::new(Arc::clone(&engine), cfg.scheduler.clone(), cfg.writer_workers);
    let dispatcher = ConnDispatcher::bind(cfg.listen_ilp, cfg.io_workers)?;

    let writer_jobs: Vec<Box<dyn Job>> = (0..cfg.writer_workers.max(1))
        .map(|w| Box::new(WriterJob::new(w, Arc::clone(&scheduler))) as Box<dyn Job>)
        .collect();
    let writer_pool = WorkerPool::start("writer", writer_jobs);

    let parser = LineParser::new(cfg.timestamp_unit);
    let io_jobs: Vec<Box<dyn Job>> = (0..cfg.io_workers.max(1))
        .map(|w| {
            Box::new(NetworkIoJob::new(
                w,
                Arc::clone(&scheduler),
                Arc::clone(&dispatcher),
                parser,
            )) as Box<dyn Job>
        })
        .collect();
    let io_pool = WorkerPool::start("ilp-io", io_jobs);

    let copy_jobs: Vec<Box<dyn Job>> = (0..cfg.copy_workers.max(1))
        .map(|_| Box::new(copy::CopyJob::new(Arc::clone(&copy_rx))) as Box<dyn Job>)
        .collect();
    let copy_pool = WorkerPool::start("ooo-copy", copy_jobs);

    tracing::info!(
        addr = %dispatcher.local_addr(),
        io_workers = cfg.io_workers,
        writer_workers = cfg.writer_workers,
        "ingest node started"
    );
    Ok(Node {
        engine,
        scheduler,
        dispatcher,
        io_pool: Some(io_pool),
        writer_pool: Some(writer_pool),
        copy_pool: Some(copy_pool),
    })
}

impl Node {
    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Orderly shutdown: stop accepting, drain I/O, let writers consume the
    /// remaining queue depth and flush their tables, close the catalog, and
    /// finally stop the copy pool (which in-flight commits may still feed).
    pub fn shutdown(mut self) {
        self.dispatcher.close();
        if let Some(pool) = self.io_pool.take() {
            pool.halt();
        }
        if let Some(pool) = self.writer_pool.take() {
            pool.halt();
        }
        self.scheduler.close();
        if let Some(pool) = self.copy_pool.take() {
            pool.halt();
        }
        tracing::info!("ingest node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.dispatcher.local_addr())
            .finish()
    }
}
