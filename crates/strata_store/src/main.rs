//! strata-store node binary: CLI, logging, and lifecycle around the
//! ingestion engine in the library crate.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use strata_store::{start_node, NodeConfig, PartitionBy, SchedulerConfig, TimestampUnit};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "strata-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

/// CLI options for running an ingestion node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    /// Line-protocol TCP listen address.
    #[arg(long, env = "STRATA_LISTEN_ILP", default_value = "127.0.0.1:9009")]
    listen_ilp: SocketAddr,

    #[arg(long, env = "STRATA_DATA_DIR")]
    data_dir: PathBuf,

    /// Network I/O worker threads.
    #[arg(long, env = "STRATA_IO_WORKERS", default_value_t = 2)]
    io_workers: usize,

    /// Table writer threads.
    #[arg(long, env = "STRATA_WRITER_WORKERS", default_value_t = 2)]
    writer_workers: usize,

    /// Out-of-order copy worker threads.
    #[arg(long, env = "STRATA_COPY_WORKERS", default_value_t = 2)]
    copy_workers: usize,

    #[arg(long, env = "STRATA_COPY_QUEUE_CAPACITY", default_value_t = 64)]
    copy_queue_capacity: usize,

    /// Slots in the writer dispatch ring (rounded up to a power of two).
    #[arg(long, env = "STRATA_WRITER_QUEUE_CAPACITY", default_value_t = 128)]
    writer_queue_capacity: usize,

    /// Maximum wire size of one measurement line, in bytes.
    #[arg(long, env = "STRATA_MAX_MEASUREMENT_SIZE", default_value_t = 2048)]
    max_measurement_size: usize,

    /// Per-table update count that triggers a load-rebalance check.
    #[arg(long, env = "STRATA_N_UPDATES_PER_LOAD_REBALANCE", default_value_t = 1024)]
    n_updates_per_load_rebalance: u32,

    /// Hottest/coolest writer load ratio that justifies moving a table.
    #[arg(long, env = "STRATA_MAX_LOAD_RATIO", default_value_t = 1.9)]
    max_load_ratio: f64,

    /// Rows a writer buffers per table before committing.
    #[arg(long, env = "STRATA_MAX_UNCOMMITTED_ROWS", default_value_t = 1000)]
    max_uncommitted_rows: u32,

    #[arg(long, env = "STRATA_MAINTENANCE_INTERVAL_MS", default_value_t = 1000)]
    maintenance_interval_ms: i64,

    /// Quiet time after which a table's writer is released to the idle pool.
    #[arg(long, env = "STRATA_MIN_IDLE_MS_BEFORE_WRITER_RELEASE", default_value_t = 30_000)]
    min_idle_ms_before_writer_release: i64,

    /// Commit hysteresis in microseconds; recent rows stay buffered.
    #[arg(long, env = "STRATA_COMMIT_HYSTERESIS_US", default_value_t = 0)]
    commit_hysteresis_us: i64,

    /// Partitioning for auto-created tables: `none` or `day`.
    #[arg(long, env = "STRATA_PARTITION_BY", default_value = "day")]
    default_partition_by: PartitionBy,

    #[arg(long, env = "STRATA_SYMBOL_CACHE", default_value_t = true, action = clap::ArgAction::Set)]
    default_symbol_cache: bool,

    #[arg(long, env = "STRATA_SYMBOL_CAPACITY", default_value_t = 256)]
    default_symbol_capacity: u32,

    /// Unit of incoming line timestamps: `ns`, `us`, `ms` or `s`.
    #[arg(long, env = "STRATA_TIMESTAMP_UNIT", default_value = "ns")]
    timestamp_unit: TimestampUnit,

    /// Interval of the periodic ingestion stats log line.
    #[arg(long, env = "STRATA_STATS_INTERVAL", default_value = "30s")]
    stats_interval: humantime::Duration,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

/// Start the node and run until ctrl-c, logging ingestion stats on a timer.
async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let mut cfg = NodeConfig::new(args.listen_ilp, args.data_dir);
    cfg.io_workers = args.io_workers.max(1);
    cfg.writer_workers = args.writer_workers.max(1);
    cfg.copy_workers = args.copy_workers.max(1);
    cfg.copy_queue_capacity = args.copy_queue_capacity;
    cfg.timestamp_unit = args.timestamp_unit;
    cfg.scheduler = SchedulerConfig {
        writer_queue_capacity: args.writer_queue_capacity,
        max_measurement_size: args.max_measurement_size,
        n_updates_per_load_rebalance: args.n_updates_per_load_rebalance,
        max_load_ratio: args.max_load_ratio,
        max_uncommitted_rows: args.max_uncommitted_rows,
        maintenance_interval_ms: args.maintenance_interval_ms.max(1),
        min_idle_ms_before_writer_release: args.min_idle_ms_before_writer_release.max(1),
        commit_hysteresis_us: args.commit_hysteresis_us.max(0),
        default_partition_by: args.default_partition_by,
        default_symbol_cache: args.default_symbol_cache,
        default_symbol_capacity: args.default_symbol_capacity,
    };

    let node = tokio::task::spawn_blocking(move || start_node(cfg))
        .await
        .expect("start task panicked")?;

    let scheduler = std::sync::Arc::clone(node.scheduler());
    let stats_interval: Duration = args.stats_interval.into();
    let mut ticker = tokio::time::interval(stats_interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    let mut last_rows = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let rows = scheduler.rows_published();
                tracing::info!(
                    rows_total = rows,
                    rows_delta = rows - last_rows,
                    rebalances = scheduler.n_rebalances(),
                    load_checks = scheduler.n_load_check_cycles(),
                    "ingestion stats"
                );
                last_rows = rows;
            }
        }
    }

    tracing::info!("shutting down");
    tokio::task::spawn_blocking(move || node.shutdown())
        .await
        .expect("shutdown task panicked");
    Ok(())
}
