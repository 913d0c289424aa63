//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use strata_store::{start_node, Node, NodeConfig, PartitionBy, SchedulerConfig};

/// Timeout for node round-trips in tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a unique per-test data directory under the system temp dir.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    std::env::temp_dir().join(format!("strata-tests-{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Scheduler settings tuned for fast, deterministic tests: unpartitioned
/// tables, per-row commits, and quick maintenance.
pub fn quick_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_uncommitted_rows: 1,
        maintenance_interval_ms: 20,
        min_idle_ms_before_writer_release: 60_000,
        default_partition_by: PartitionBy::None,
        ..SchedulerConfig::default()
    }
}

/// Start an in-process node on an ephemeral port.
pub fn start_test_node(name: &str, tune: impl FnOnce(&mut NodeConfig)) -> (Node, PathBuf) {
    let dir = test_dir(name);
    let mut cfg = NodeConfig::new("127.0.0.1:0".parse().unwrap(), &dir);
    cfg.scheduler = quick_scheduler_config();
    tune(&mut cfg);
    let node = start_node(cfg).expect("start node");
    (node, dir)
}

/// Write raw line-protocol bytes to the ingest port.
pub fn ilp_send(addr: SocketAddr, payload: &str) {
    let mut stream = TcpStream::connect(addr).expect("connect ingest port");
    stream.write_all(payload.as_bytes()).expect("write lines");
    stream.flush().ok();
}

/// Poll until `check` passes or the timeout expires.
pub fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
