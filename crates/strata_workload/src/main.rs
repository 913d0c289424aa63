//! Workload generator for exercising strata over the line protocol.
//!
//! This binary streams generated measurements at one or more ingest nodes
//! from concurrent TCP clients, optionally backdating a fraction of rows to
//! force out-of-order partition merges, and writes a JSON run summary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "strata-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated ingest endpoints, e.g. `127.0.0.1:9009,127.0.0.1:9010`
    #[arg(long)]
    nodes: String,

    /// Number of concurrent clients (each client uses one TCP connection).
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Number of distinct tables written to.
    #[arg(long, default_value_t = 4)]
    tables: usize,

    /// Table name prefix. Tables are generated as `{table_prefix}{idx}`.
    #[arg(long, default_value = "strata_")]
    table_prefix: String,

    /// Cardinality of the `host` tag.
    #[arg(long, default_value_t = 16)]
    tag_cardinality: usize,

    /// Number of double fields per row.
    #[arg(long, default_value_t = 2)]
    fields: usize,

    /// Percent of rows whose timestamp is backdated to force a merge.
    #[arg(long, default_value_t = 0)]
    ooo_pct: u8,

    /// How far back out-of-order rows reach.
    #[arg(long, default_value = "5s")]
    ooo_window: humantime::Duration,

    /// Rows each client writes between flushes.
    #[arg(long, default_value_t = 64)]
    batch_rows: usize,

    /// Total runtime for the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// When true, any write error aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write a JSON run summary to this path.
    #[arg(long, default_value = ".tmp/workload/summary.json")]
    out: PathBuf,
}

/// Metadata embedded in the summary file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct SummaryMeta {
    nodes: Vec<String>,
    clients: usize,
    tables: usize,
    tag_cardinality: usize,
    fields: usize,
    ooo_pct: u8,
    duration_ms: u64,
    seed: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct RunSummary {
    meta: SummaryMeta,
    rows_written: u64,
    write_errors: u64,
    elapsed_ms: u64,
    rows_per_sec: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let nodes: Vec<SocketAddr> = args
        .nodes
        .split(',')
        .map(|s| s.trim().parse().with_context(|| format!("bad node address {s:?}")))
        .collect::<anyhow::Result<_>>()?;
    anyhow::ensure!(!nodes.is_empty(), "at least one node is required");

    let seed = if args.seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    } else {
        args.seed
    };
    tracing::info!(seed, clients = args.clients, tables = args.tables, "workload starting");

    let rows_written = Arc::new(AtomicU64::new(0));
    let write_errors = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let deadline = started + Into::<Duration>::into(args.duration);

    let mut handles = Vec::with_capacity(args.clients);
    for client in 0..args.clients.max(1) {
        let node = nodes[client % nodes.len()];
        let args = args.clone();
        let rows_written = Arc::clone(&rows_written);
        let write_errors = Arc::clone(&write_errors);
        handles.push(tokio::spawn(async move {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(client as u64));
            let mut stream = TcpStream::connect(node)
                .await
                .with_context(|| format!("connect {node}"))?;
            let mut batch = String::new();
            while Instant::now() < deadline {
                batch.clear();
                for _ in 0..args.batch_rows.max(1) {
                    push_line(&mut batch, &args, &mut rng);
                }
                match stream.write_all(batch.as_bytes()).await {
                    Ok(()) => {
                        rows_written.fetch_add(args.batch_rows as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        write_errors.fetch_add(1, Ordering::Relaxed);
                        if args.fail_fast {
                            return Err(err).context("write batch");
                        }
                        // Reconnect and carry on.
                        stream = TcpStream::connect(node)
                            .await
                            .with_context(|| format!("reconnect {node}"))?;
                    }
                }
            }
            stream.flush().await.ok();
            Ok::<(), anyhow::Error>(())
        }));
    }

    for handle in handles {
        handle.await.expect("client task panicked")?;
    }

    let elapsed = started.elapsed();
    let rows = rows_written.load(Ordering::Relaxed);
    let summary = RunSummary {
        meta: SummaryMeta {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            clients: args.clients,
            tables: args.tables,
            tag_cardinality: args.tag_cardinality,
            fields: args.fields,
            ooo_pct: args.ooo_pct,
            duration_ms: Into::<Duration>::into(args.duration).as_millis() as u64,
            seed,
        },
        rows_written: rows,
        write_errors: write_errors.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis() as u64,
        rows_per_sec: rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    };

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(&args.out, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("write summary [path={}]", args.out.display()))?;
    tracing::info!(
        rows = summary.rows_written,
        rows_per_sec = format!("{:.0}", summary.rows_per_sec),
        errors = summary.write_errors,
        out = %args.out.display(),
        "workload finished"
    );
    Ok(())
}

/// Append one generated measurement line to `batch`.
fn push_line(batch: &mut String, args: &RunArgs, rng: &mut SmallRng) {
    use std::fmt::Write;

    let table = rng.gen_range(0..args.tables.max(1));
    let host = rng.gen_range(0..args.tag_cardinality.max(1));
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    let ts = if args.ooo_pct > 0 && rng.gen_range(0..100u8) < args.ooo_pct {
        let window_ns = Into::<Duration>::into(args.ooo_window).as_nanos() as i64;
        now_ns - rng.gen_range(0..window_ns.max(1))
    } else {
        now_ns
    };

    write!(batch, "{}{table},host=h{host} ", args.table_prefix).unwrap();
    for field in 0..args.fields.max(1) {
        if field > 0 {
            batch.push(',');
        }
        write!(batch, "f{field}={:.4}", rng.gen_range(0.0..100.0f64)).unwrap();
    }
    writeln!(batch, " {ts}").unwrap();
}
