//! Out-of-order ingestion rewrites the partition in timestamp order.

mod common;

use strata_store::{ColumnData, TimestampUnit};

#[test]
fn out_of_order_lines_merge_in_timestamp_order() {
    let (node, dir) = common::start_test_node("ooo-merge", |cfg| {
        cfg.timestamp_unit = TimestampUnit::Micros;
        cfg.scheduler.max_uncommitted_rows = 3;
    });
    let addr = node.local_addr();
    let engine = std::sync::Arc::clone(node.engine());

    common::ilp_send(
        addr,
        "sensors,loc=a v=100 100\nsensors,loc=a v=200 200\nsensors,loc=a v=300 300\n",
    );
    common::wait_until("in-order rows committed", || {
        engine
            .reader_meta("sensors")
            .map(|m| m.row_count() == 3)
            .unwrap_or(false)
    });

    // Late batch straddles the committed rows and triggers a merge rewrite.
    common::ilp_send(addr, "sensors,loc=a v=150 150\nsensors,loc=a v=250 250\n");
    common::wait_until("merged rows committed", || {
        engine
            .reader_meta("sensors")
            .map(|m| m.row_count() == 5)
            .unwrap_or(false)
    });

    assert_eq!(
        engine.read_column("sensors", "default", "timestamp").unwrap(),
        ColumnData::Long(vec![100, 150, 200, 250, 300])
    );
    assert_eq!(
        engine.read_column("sensors", "default", "v").unwrap(),
        ColumnData::Double(vec![100.0, 150.0, 200.0, 250.0, 300.0])
    );
    // Symbol ids survive the rewrite too.
    assert_eq!(
        engine.read_column("sensors", "default", "loc").unwrap(),
        ColumnData::Sym(vec![0, 0, 0, 0, 0])
    );

    node.shutdown();
    common::cleanup_dir(&dir);
}

#[test]
fn backdated_workload_stays_sorted() {
    let (node, dir) = common::start_test_node("ooo-random", |cfg| {
        cfg.timestamp_unit = TimestampUnit::Micros;
        cfg.scheduler.max_uncommitted_rows = 5;
    });
    let addr = node.local_addr();
    let engine = std::sync::Arc::clone(node.engine());

    // A fixed shuffle with plenty of backdating across commit boundaries.
    let timestamps = [
        500i64, 900, 300, 1_200, 100, 700, 1_100, 200, 1_000, 400, 800, 600,
    ];
    let mut payload = String::new();
    for ts in timestamps {
        payload.push_str(&format!("jitter v={ts} {ts}\n"));
    }
    common::ilp_send(addr, &payload);
    common::wait_until("all rows committed", || {
        engine
            .reader_meta("jitter")
            .map(|m| m.row_count() == timestamps.len() as u64)
            .unwrap_or(false)
    });

    let mut expected = timestamps.to_vec();
    expected.sort_unstable();
    assert_eq!(
        engine.read_column("jitter", "default", "timestamp").unwrap(),
        ColumnData::Long(expected.clone())
    );
    let values = engine.read_column("jitter", "default", "v").unwrap();
    let values: Vec<i64> = values.as_doubles().iter().map(|v| *v as i64).collect();
    assert_eq!(values, expected);

    node.shutdown();
    common::cleanup_dir(&dir);
}
