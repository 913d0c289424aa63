//! End-to-end ingestion over the line-protocol TCP port.

mod common;

use strata_store::table::LONG_NULL;
use strata_store::{ColumnData, ColumnType};

#[test]
fn first_line_creates_table_columns_and_row() {
    let (node, dir) = common::start_test_node("ingest-basic", |_| {});
    let addr = node.local_addr();
    let engine = std::sync::Arc::clone(node.engine());

    common::ilp_send(addr, "weather,loc=eu temp=21.5 1000\n");
    common::wait_until("first row committed", || {
        engine
            .reader_meta("weather")
            .map(|m| m.row_count() == 1)
            .unwrap_or(false)
    });

    let meta = engine.reader_meta("weather").unwrap();
    let columns: Vec<(String, ColumnType)> = meta
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.col_type))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("loc".to_string(), ColumnType::Symbol),
            ("temp".to_string(), ColumnType::Double),
            ("timestamp".to_string(), ColumnType::Timestamp),
        ]
    );
    assert_eq!(meta.timestamp_index, 2);

    // 1000ns on the wire lands as 1us.
    assert_eq!(
        engine.read_column("weather", "default", "timestamp").unwrap(),
        ColumnData::Long(vec![1])
    );
    assert_eq!(
        engine.read_column("weather", "default", "temp").unwrap(),
        ColumnData::Double(vec![21.5])
    );
    assert_eq!(
        engine.read_column("weather", "default", "loc").unwrap(),
        ColumnData::Sym(vec![0])
    );
    assert_eq!(engine.read_symbols("weather", "loc").unwrap(), vec!["eu"]);

    node.shutdown();
    common::cleanup_dir(&dir);
}

#[test]
fn new_field_mid_stream_adds_a_column() {
    let (node, dir) = common::start_test_node("ingest-add-column", |_| {});
    let addr = node.local_addr();
    let engine = std::sync::Arc::clone(node.engine());

    common::ilp_send(addr, "weather,loc=eu temp=21.5 1000\n");
    common::wait_until("first row committed", || {
        engine
            .reader_meta("weather")
            .map(|m| m.row_count() == 1)
            .unwrap_or(false)
    });

    common::ilp_send(addr, "weather,loc=eu temp=22.0,hum=80i 2000\n");
    common::wait_until("second row committed", || {
        engine
            .reader_meta("weather")
            .map(|m| m.row_count() == 2)
            .unwrap_or(false)
    });

    let meta = engine.reader_meta("weather").unwrap();
    let hum = meta.columns.iter().find(|c| c.name == "hum").unwrap();
    assert_eq!(hum.col_type, ColumnType::Long);

    // The first row predates the column and reads as null.
    assert_eq!(
        engine.read_column("weather", "default", "hum").unwrap(),
        ColumnData::Long(vec![LONG_NULL, 80])
    );
    assert_eq!(
        engine.read_column("weather", "default", "temp").unwrap(),
        ColumnData::Double(vec![21.5, 22.0])
    );

    node.shutdown();
    common::cleanup_dir(&dir);
}

#[test]
fn bad_lines_are_skipped_and_good_ones_survive() {
    let (node, dir) = common::start_test_node("ingest-bad-lines", |_| {});
    let addr = node.local_addr();
    let engine = std::sync::Arc::clone(node.engine());

    common::ilp_send(
        addr,
        "ok v=1i 1000\nbroken v=\nok v=oops 3000\nok v=2i 2000\n",
    );
    common::wait_until("good rows committed", || {
        engine
            .reader_meta("ok")
            .map(|m| m.row_count() == 2)
            .unwrap_or(false)
    });

    assert_eq!(
        engine.read_column("ok", "default", "v").unwrap(),
        ColumnData::Long(vec![1, 2])
    );

    node.shutdown();
    common::cleanup_dir(&dir);
}
