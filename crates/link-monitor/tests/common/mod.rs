#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use doublezero_link_monitor::{
    MetricRecord, OrchestratorConfig, Result,
    runner::{MockTestRunner, Protocol, RawResult, Summary, TestSpec},
    store::StoreWriter,
};
use std::{path::Path, time::Duration};

/// A received-side summary at `mbps`.
pub fn raw_result(mbps: f64) -> RawResult {
    RawResult {
        sum_received: Some(Summary {
            bits_per_second: mbps * 1e6,
            retransmits: None,
            lost_percent: None,
            jitter_ms: None,
        }),
        sum_sent: None,
    }
}

pub fn test_spec() -> TestSpec {
    TestSpec {
        target: "127.0.0.1".to_string(),
        port: 5201,
        duration: Duration::from_secs(1),
        parallel: 1,
        protocol: Protocol::Tcp,
        bandwidth: None,
    }
}

/// Fast schedule against a store at `store_path`.
pub fn create_test_config(store_path: &Path, max_cycles: Option<u64>) -> OrchestratorConfig {
    OrchestratorConfig {
        test: test_spec(),
        store_path: store_path.to_path_buf(),
        interval: Duration::from_millis(1),
        max_cycles,
        max_retries: 0,
    }
}

/// Runner that hands out `results` in order, one per call.
pub fn scripted_runner(results: Vec<Result<RawResult>>) -> MockTestRunner {
    let calls = results.len();
    let mut results = results.into_iter();
    let mut runner = MockTestRunner::new();
    runner
        .expect_run()
        .times(calls)
        .returning(move |_| results.next().expect("runner called too often"));
    runner
}

pub fn timestamp(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
}

/// Write nominal history before the monitor opens the store.
pub fn seed_store(path: &Path, throughputs: &[f64]) {
    let mut writer = StoreWriter::open_or_create(path).unwrap();
    for (i, &throughput) in throughputs.iter().enumerate() {
        writer
            .append(&MetricRecord::new(timestamp(i as i64 * 10), throughput))
            .unwrap();
    }
}
