//! Offline labeling of historical records for model training.
//!
//! The throughput rule compares each record against the mean of the whole
//! set, so labels are retrospective and are never computed in the live loop.

use crate::record::{MetricRecord, format_timestamp};
use csv::Writer;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::path::Path;
use tracing::info;

pub const MAX_LATENCY_MS: f64 = 50.0;
pub const MAX_LOST_PERCENT: f64 = 5.0;
/// Fraction of the mean throughput below which a record counts as degraded.
pub const MIN_THROUGHPUT_RATIO: f64 = 0.5;

/// Label each record as degraded when latency > 50ms, loss > 5%, or
/// throughput < 50% of the set's mean throughput. Absent values never
/// trigger a rule.
pub fn heuristic_labels(records: &[MetricRecord]) -> Vec<bool> {
    if records.is_empty() {
        return Vec::new();
    }

    let mean_throughput = records.iter().map(|r| r.throughput_mbps).mean();
    let throughput_floor = mean_throughput * MIN_THROUGHPUT_RATIO;

    records
        .iter()
        .map(|r| {
            r.latency_ms.is_some_and(|v| v > MAX_LATENCY_MS)
                || r.lost_percent.is_some_and(|v| v > MAX_LOST_PERCENT)
                || r.throughput_mbps < throughput_floor
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct LabeledRow {
    timestamp: String,
    throughput_mbps: f64,
    latency_ms: Option<f64>,
    jitter_ms: Option<f64>,
    lost_percent: Option<f64>,
    degraded: u8,
}

/// Write a training dataset: the four feature columns plus the heuristic label.
pub fn export_labeled(records: &[MetricRecord], path: &Path) -> anyhow::Result<usize> {
    let labels = heuristic_labels(records);

    let mut writer = Writer::from_path(path)?;
    for (record, degraded) in records.iter().zip(labels.iter()) {
        writer.serialize(LabeledRow {
            timestamp: format_timestamp(&record.timestamp),
            throughput_mbps: record.throughput_mbps,
            latency_ms: record.latency_ms,
            jitter_ms: record.jitter_ms,
            lost_percent: record.lost_percent,
            degraded: u8::from(*degraded),
        })?;
    }
    writer.flush()?;

    let degraded = labels.iter().filter(|l| **l).count();
    info!(
        path = %path.display(),
        rows = records.len(),
        degraded,
        "wrote labeled dataset"
    );
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(throughput: f64, latency: Option<f64>, lost: Option<f64>) -> MetricRecord {
        let mut record = MetricRecord::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), throughput);
        record.latency_ms = latency;
        record.lost_percent = lost;
        record
    }

    #[test]
    fn test_heuristic_rules() {
        let records = vec![
            record(100.0, Some(10.0), Some(0.0)),
            record(100.0, Some(60.0), Some(0.0)),
            record(100.0, Some(10.0), Some(7.5)),
            // mean throughput is 82.5, floor 41.25
            record(30.0, Some(10.0), Some(0.0)),
        ];

        assert_eq!(heuristic_labels(&records), vec![false, true, true, true]);
    }

    #[test]
    fn test_absent_values_do_not_trigger() {
        let records = vec![record(100.0, None, None), record(90.0, None, None)];
        assert_eq!(heuristic_labels(&records), vec![false, false]);
        assert!(heuristic_labels(&[]).is_empty());
    }

    #[test]
    fn test_export_labeled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.csv");

        let records = vec![record(100.0, Some(10.0), None), record(100.0, Some(75.0), None)];
        assert_eq!(export_labeled(&records, &path).unwrap(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,throughput_mbps,latency_ms,jitter_ms,lost_percent,degraded"
        );
        assert!(lines[1].ends_with(",0"));
        assert!(lines[2].ends_with(",1"));
    }
}
