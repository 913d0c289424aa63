//! Type conversion rules at the writer: integer narrowing honors the target
//! column's bounds and invalid names fail the row or the table.

mod common;

use std::sync::Arc;

use strata_store::table::{ColumnType, TableStatus, TableStructure};
use strata_store::{
    copy_queue, ColumnData, Engine, IoWorkerState, Job, LineParser, PartitionBy, Scheduler,
    SchedulerConfig, TimestampUnit, WriterJob,
};

fn harness(tag: &str) -> (Arc<Engine>, Arc<Scheduler>, WriterJob, IoWorkerState, std::path::PathBuf)
{
    let dir = common::test_dir(tag);
    let (publisher, _rx) = copy_queue(16);
    let engine = Engine::open(&dir, publisher).unwrap();
    let cfg = SchedulerConfig {
        max_uncommitted_rows: 1,
        default_partition_by: PartitionBy::None,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(Arc::clone(&engine), cfg, 1);
    let job = WriterJob::new(0, Arc::clone(&scheduler));
    (engine, scheduler, job, IoWorkerState::new(0), dir)
}

#[test]
fn integer_narrowing_enforces_target_bounds() {
    let (engine, scheduler, mut w0, mut state, dir) = harness("narrowing");
    engine
        .create_table(&TableStructure {
            name: "narrow".to_string(),
            columns: vec![
                ("i".to_string(), ColumnType::Int),
                ("s".to_string(), ColumnType::Short),
                ("b".to_string(), ColumnType::Byte),
            ],
            partition_by: PartitionBy::None,
            symbol_cache: true,
            symbol_capacity: 256,
        })
        .unwrap();
    let parser = LineParser::new(TimestampUnit::Micros);
    let mut publish = |text: &str| {
        let line = parser.parse(text.as_bytes()).unwrap();
        assert!(scheduler.try_commit_row(&mut state, &line));
    };

    publish("narrow i=1i,s=2i,b=3i 1000");
    while w0.run(0) {}
    assert_eq!(engine.reader_meta("narrow").unwrap().row_count(), 1);

    // Each of these overflows its target column and cancels the row.
    publish("narrow i=2147483648i 2000");
    publish("narrow s=40000i 3000");
    publish("narrow b=200i 4000");
    while w0.run(0) {}
    assert_eq!(engine.reader_meta("narrow").unwrap().row_count(), 1);

    // Boundary values still fit.
    publish("narrow i=-2147483648i,s=-32768i,b=-128i 5000");
    while w0.run(0) {}
    assert_eq!(engine.reader_meta("narrow").unwrap().row_count(), 2);

    assert_eq!(
        engine.read_column("narrow", "default", "i").unwrap(),
        ColumnData::Int(vec![1, i32::MIN])
    );
    assert_eq!(
        engine.read_column("narrow", "default", "s").unwrap(),
        ColumnData::Short(vec![2, i16::MIN])
    );
    assert_eq!(
        engine.read_column("narrow", "default", "b").unwrap(),
        ColumnData::Byte(vec![3, i8::MIN])
    );

    common::cleanup_dir(&dir);
}

#[test]
fn invalid_names_fail_the_row_or_the_table() {
    let (engine, scheduler, mut w0, mut state, dir) = harness("bad-names");
    let parser = LineParser::new(TimestampUnit::Micros);

    // A table whose name the catalog refuses: consumed and dropped.
    let line = parser.parse(b"we?ird v=1i 1000").unwrap();
    assert!(scheduler.try_commit_row(&mut state, &line));
    assert_eq!(engine.status("we?ird"), TableStatus::DoesNotExist);

    // A valid table, then a field whose column name cannot be created: the
    // row is cancelled, earlier rows survive.
    let line = parser.parse(b"t2 ok=1i 1000").unwrap();
    assert!(scheduler.try_commit_row(&mut state, &line));
    let line = parser.parse(b"t2 bad.col=2i 2000").unwrap();
    assert!(scheduler.try_commit_row(&mut state, &line));
    while w0.run(0) {}

    assert_eq!(engine.reader_meta("t2").unwrap().row_count(), 1);
    assert_eq!(
        engine.read_column("t2", "default", "ok").unwrap(),
        ColumnData::Long(vec![1])
    );
    assert!(engine
        .reader_meta("t2")
        .unwrap()
        .column_index("bad.col")
        .is_none());

    common::cleanup_dir(&dir);
}
