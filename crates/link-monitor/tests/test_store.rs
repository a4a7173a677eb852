mod common;

use common::timestamp;
use doublezero_link_monitor::{
    MetricRecord,
    store::{MetricsStore, StoreWriter},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};
use tempfile::TempDir;

const APPENDS: usize = 200;

fn record(i: usize) -> MetricRecord {
    let mut record = MetricRecord::new(timestamp(i as i64), i as f64);
    record.latency_ms = Some(1.5);
    record.jitter_ms = (i % 2 == 0).then_some(0.25);
    record.predicted_degraded = Some(i % 3 == 0);
    record
}

#[test]
fn test_appends_are_all_readable_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metrics.csv");

    let mut writer = StoreWriter::open_or_create(&path).unwrap();
    for i in 0..APPENDS {
        writer.append(&record(i)).unwrap();
    }
    assert_eq!(writer.record_count(), APPENDS);

    let history = MetricsStore::new(&path).load_all().unwrap();
    assert_eq!(history.len(), APPENDS);
    for (i, loaded) in history.iter().enumerate() {
        assert_eq!(loaded, &record(i));
    }
}

#[test]
fn test_concurrent_readers_see_growing_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metrics.csv");
    let mut writer = StoreWriter::open_or_create(&path).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = writer.reader();
            let done = done.clone();
            thread::spawn(move || {
                let mut last_len = 0;
                let mut reads = 0;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let history = store.load_all().unwrap();
                    assert!(history.len() >= last_len, "history shrank");
                    for (i, loaded) in history.iter().enumerate() {
                        assert_eq!(loaded, &record(i), "partial or reordered record");
                    }
                    last_len = history.len();
                    reads += 1;
                    if finished {
                        break;
                    }
                }
                reads
            })
        })
        .collect();

    for i in 0..APPENDS {
        writer.append(&record(i)).unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() >= 1);
    }
    assert_eq!(writer.reader().load_all().unwrap().len(), APPENDS);
}

#[test]
fn test_reopen_keeps_last_timestamp() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metrics.csv");

    {
        let mut writer = StoreWriter::open_or_create(&path).unwrap();
        writer.append(&record(0)).unwrap();
        writer.append(&record(5)).unwrap();
    }

    let writer = StoreWriter::open_or_create(&path).unwrap();
    assert_eq!(writer.record_count(), 2);
    assert_eq!(writer.last_timestamp(), Some(timestamp(5)));
}
