//! Idle tables release their writer to the idle pool and revive cleanly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use strata_store::catalog::millis_now;
use strata_store::table::WriterError;
use strata_store::{
    copy_queue, ColumnData, Engine, IoWorkerState, Job, LineParser, PartitionBy, Scheduler,
    SchedulerConfig, TimestampUnit, WriterJob,
};

#[test]
fn idle_table_releases_writer_and_revives() {
    let dir = common::test_dir("idle-release");
    let (publisher, _rx) = copy_queue(16);
    let engine = Engine::open(&dir, publisher).unwrap();
    let cfg = SchedulerConfig {
        max_uncommitted_rows: 1,
        min_idle_ms_before_writer_release: 100,
        default_partition_by: PartitionBy::None,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(Arc::clone(&engine), cfg, 1);
    let mut w0 = WriterJob::new(0, Arc::clone(&scheduler));
    let mut state = IoWorkerState::new(0);
    let parser = LineParser::new(TimestampUnit::Micros);

    let line = parser.parse(b"x v=1 1000").unwrap();
    assert!(scheduler.try_commit_row(&mut state, &line));
    while w0.run(0) {}
    assert_eq!(engine.reader_meta("x").unwrap().row_count(), 1);
    assert!(scheduler.is_table_active("x"));

    // The pipeline holds the writer while the table is active.
    assert!(matches!(engine.writer("x"), Err(WriterError::Busy)));

    std::thread::sleep(Duration::from_millis(150));
    assert!(scheduler.run_idle_maintenance(&mut state, millis_now()));
    assert!(scheduler.is_table_idle("x"));

    // The writer thread closes the handle; the writer becomes acquirable.
    while w0.run(0) {}
    let external = engine.writer("x").expect("writer free after idle release");
    drop(external);

    // A new measurement revives the table and reopens the writer.
    let line = parser.parse(b"x v=2 2000").unwrap();
    assert!(scheduler.try_commit_row(&mut state, &line));
    assert!(scheduler.is_table_active("x"));
    assert!(!scheduler.is_table_idle("x"));
    while w0.run(0) {}

    assert_eq!(engine.reader_meta("x").unwrap().row_count(), 2);
    assert_eq!(
        engine.read_column("x", "default", "timestamp").unwrap(),
        ColumnData::Long(vec![1_000, 2_000])
    );

    common::cleanup_dir(&dir);
}

#[test]
fn only_the_sole_holder_publishes_the_release() {
    let dir = common::test_dir("idle-two-workers");
    let (publisher, _rx) = copy_queue(16);
    let engine = Engine::open(&dir, publisher).unwrap();
    let cfg = SchedulerConfig {
        max_uncommitted_rows: 1,
        min_idle_ms_before_writer_release: 50,
        default_partition_by: PartitionBy::None,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(Arc::clone(&engine), cfg, 1);
    let mut w0 = WriterJob::new(0, Arc::clone(&scheduler));
    let mut io0 = IoWorkerState::new(0);
    let mut io1 = IoWorkerState::new(1);
    let parser = LineParser::new(TimestampUnit::Micros);

    let line = parser.parse(b"shared v=1 1000").unwrap();
    assert!(scheduler.try_commit_row(&mut io0, &line));
    let line = parser.parse(b"shared v=2 2000").unwrap();
    assert!(scheduler.try_commit_row(&mut io1, &line));
    while w0.run(0) {}

    std::thread::sleep(Duration::from_millis(80));

    // The first worker only steps away; the table stays active.
    scheduler.run_idle_maintenance(&mut io0, millis_now());
    assert!(scheduler.is_table_active("shared"));
    assert_eq!(io0.cached_tables(), 0);

    // The last holder triggers the actual release.
    assert!(scheduler.run_idle_maintenance(&mut io1, millis_now()));
    assert!(scheduler.is_table_idle("shared"));
    while w0.run(0) {}
    assert!(engine.writer("shared").is_ok());

    common::cleanup_dir(&dir);
}
