//! Load rebalancing moves a table between writer threads without losing or
//! reordering rows. Driven at the library level so both writer jobs run
//! deterministically on the test thread.

mod common;

use std::sync::Arc;

use strata_store::{
    copy_queue, ColumnData, Engine, IoWorkerState, Job, LineParser, PartitionBy, Scheduler,
    SchedulerConfig, TimestampUnit, WriterJob,
};

fn drain(w0: &mut WriterJob, w1: &mut WriterJob) {
    loop {
        let busy0 = w0.run(0);
        let busy1 = w1.run(1);
        if !busy0 && !busy1 {
            break;
        }
    }
}

#[test]
fn hot_writer_sheds_its_lightest_table() {
    let dir = common::test_dir("rebalance");
    let (publisher, _rx) = copy_queue(16);
    let engine = Engine::open(&dir, publisher).unwrap();
    let cfg = SchedulerConfig {
        writer_queue_capacity: 256,
        n_updates_per_load_rebalance: 50,
        max_load_ratio: 2.0,
        max_uncommitted_rows: 1,
        min_idle_ms_before_writer_release: 600_000,
        default_partition_by: PartitionBy::None,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(Arc::clone(&engine), cfg, 2);
    let mut w0 = WriterJob::new(0, Arc::clone(&scheduler));
    let mut w1 = WriterJob::new(1, Arc::clone(&scheduler));
    let mut state = IoWorkerState::new(0);
    let parser = LineParser::new(TimestampUnit::Micros);

    let mut publish = |text: String| {
        let line = parser.parse(text.as_bytes()).unwrap();
        assert!(scheduler.try_commit_row(&mut state, &line), "queue refused {text}");
    };

    // Three tables; the load-based assignment puts `a` and `c` on thread 0
    // and `b` on thread 1.
    publish("a v=1 1".to_string());
    publish("b v=1 1".to_string());
    publish("c v=1 1".to_string());
    assert_eq!(scheduler.writer_thread_of("a"), Some(0));
    assert_eq!(scheduler.writer_thread_of("b"), Some(1));
    assert_eq!(scheduler.writer_thread_of("c"), Some(0));

    // Hammer `a` until the update counter crosses the rebalance threshold.
    for i in 0..60 {
        publish(format!("a v=1 {}", 100 + i));
    }
    assert_eq!(scheduler.n_rebalances(), 1, "expected exactly one table move");
    assert_eq!(
        scheduler.writer_thread_of("c"),
        Some(1),
        "the lightest table on the hot thread moves to the cool one"
    );
    assert_eq!(scheduler.writer_thread_of("a"), Some(0));

    // The handover completes once the old owner releases; interleave the
    // workers until the queue is dry.
    drain(&mut w0, &mut w1);

    // Rows published after the move are applied by the new owner, in order.
    for i in 0..10 {
        publish(format!("c v={} {}", i, 1_000 + i));
    }
    drain(&mut w1, &mut w0);

    let meta = engine.reader_meta("c").unwrap();
    assert_eq!(meta.row_count(), 11, "no rows lost across the move");
    let ts = engine.read_column("c", "default", "timestamp").unwrap();
    let expected: Vec<i64> = std::iter::once(1)
        .chain((0..10).map(|i| 1_000 + i))
        .collect();
    assert_eq!(ts, ColumnData::Long(expected));

    // Totals across all tables match what was published.
    let total: u64 = ["a", "b", "c"]
        .iter()
        .map(|t| engine.reader_meta(t).unwrap().row_count())
        .sum();
    assert_eq!(total, scheduler.rows_published());

    common::cleanup_dir(&dir);
}
