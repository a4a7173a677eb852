//! Two-sigma anomaly detection over a metric's full history.

use crate::record::{Metric, MetricRecord, format_timestamp};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use statrs::statistics::Statistics;

/// Default deviation threshold, in sample standard deviations.
pub const DEFAULT_SIGMA_THRESHOLD: f64 = 2.0;

/// A value in a series that deviates beyond the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    /// Position in the input series.
    pub index: usize,
    pub value: f64,
    /// Signed distance from the mean in standard deviations.
    pub sigma: f64,
}

/// A flagged value joined back to the record it belongs to. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyFlag {
    /// Position of the record in store order.
    pub index: usize,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
    pub deviation_sigma: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    threshold: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIGMA_THRESHOLD,
        }
    }
}

impl AnomalyDetector {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Flag every present value whose absolute deviation from the mean exceeds
    /// `threshold` sample standard deviations.
    ///
    /// Absent and non-finite values take no part in the statistics and are
    /// never flagged. Fewer than two usable values yields no flags.
    pub fn detect(&self, series: &[Option<f64>]) -> Vec<Deviation> {
        let present: Vec<(usize, f64)> = series
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.filter(|v| v.is_finite()).map(|v| (index, v)))
            .collect();

        if present.len() < 2 {
            return Vec::new();
        }

        let values: Vec<f64> = present.iter().map(|(_, v)| *v).collect();
        let mean = values.iter().mean();
        let std_dev = values.iter().std_dev();

        if !std_dev.is_finite() || std_dev <= 0.0 {
            return Vec::new();
        }

        present
            .into_iter()
            .filter(|(_, value)| (value - mean).abs() > self.threshold * std_dev)
            .map(|(index, value)| Deviation {
                index,
                value,
                sigma: (value - mean) / std_dev,
            })
            .collect()
    }

    /// Run [`detect`](Self::detect) for every metric, ordered by record
    /// position then metric.
    pub fn detect_all(&self, records: &[MetricRecord]) -> Vec<AnomalyFlag> {
        let mut flags: Vec<AnomalyFlag> = Metric::ALL
            .iter()
            .flat_map(|metric| {
                self.detect(&metric.series(records))
                    .into_iter()
                    .map(move |d| AnomalyFlag {
                        index: d.index,
                        timestamp: records[d.index].timestamp,
                        metric: *metric,
                        value: d.value,
                        deviation_sigma: d.sigma,
                    })
            })
            .collect();

        flags.sort_by_key(|flag| (flag.index, flag.metric));
        flags
    }
}

fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn flagged(deviations: &[Deviation]) -> Vec<usize> {
        deviations.iter().map(|d| d.index).collect()
    }

    #[test]
    fn test_short_series_never_flags() {
        let detector = AnomalyDetector::default();
        assert!(detector.detect(&[]).is_empty());
        assert!(detector.detect(&series(&[1000.0])).is_empty());
        assert!(detector.detect(&[Some(1.0), None, None]).is_empty());
    }

    #[test]
    fn test_ten_sigma_outlier_is_the_only_flag() {
        // The rest has mean 10 and sample std ~0.816; 18.2 is ~10 std away
        let values = [10.0, 11.0, 9.0, 10.0, 18.2, 10.0, 11.0, 9.0];
        let deviations = AnomalyDetector::default().detect(&series(&values));

        assert_eq!(flagged(&deviations), vec![4]);
        assert_eq!(deviations[0].value, 18.2);
        assert!(deviations[0].sigma > 2.0);
    }

    #[test]
    fn test_low_outlier_has_negative_sigma() {
        let values = [100.0, 101.0, 99.0, 100.0, 98.0, 100.0, 102.0, 3.0];
        let deviations = AnomalyDetector::default().detect(&series(&values));

        assert_eq!(flagged(&deviations), vec![7]);
        assert!(deviations[0].sigma < -2.0);
    }

    #[test]
    fn test_three_values_cannot_exceed_two_sigma() {
        // With n samples the largest possible |z| is (n-1)/sqrt(n)
        let deviations = AnomalyDetector::default().detect(&series(&[100.0, 102.0, 3.0]));
        assert!(deviations.is_empty());
    }

    #[test]
    fn test_absent_values_are_skipped_but_positions_kept() {
        let values = vec![
            Some(10.0),
            None,
            Some(11.0),
            Some(9.0),
            None,
            Some(10.0),
            Some(18.2),
            Some(10.0),
            Some(11.0),
            Some(9.0),
        ];
        let deviations = AnomalyDetector::default().detect(&values);
        assert_eq!(flagged(&deviations), vec![6]);
    }

    #[test]
    fn test_constant_series_has_no_flags() {
        let deviations = AnomalyDetector::default().detect(&series(&[0.0; 12]));
        assert!(deviations.is_empty());
    }

    #[test]
    fn test_detection_is_order_independent() {
        let detector = AnomalyDetector::default();
        let forward = [10.0, 11.0, 9.0, 10.0, 18.2, 10.0, 11.0, 9.0];
        let mut reversed = forward;
        reversed.reverse();

        let a = detector.detect(&series(&forward));
        let b = detector.detect(&series(&reversed));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].value, b[0].value);
        assert_eq!(b[0].index, forward.len() - 1 - a[0].index);
    }

    #[test]
    fn test_detect_all_joins_flags_to_records() {
        let records: Vec<MetricRecord> = [10.0, 11.0, 9.0, 10.0, 18.2, 10.0, 11.0, 9.0]
            .iter()
            .enumerate()
            .map(|(i, &throughput)| {
                let mut record =
                    MetricRecord::new(Utc.timestamp_opt(1_000 + i as i64, 0).unwrap(), throughput);
                record.latency_ms = Some(if i == 2 { 250.0 } else { 5.0 });
                record
            })
            .collect();

        let flags = AnomalyDetector::default().detect_all(&records);
        let keys: Vec<(usize, Metric)> = flags.iter().map(|f| (f.index, f.metric)).collect();
        assert_eq!(
            keys,
            vec![(2, Metric::LatencyMs), (4, Metric::ThroughputMbps)]
        );
        assert_eq!(flags[1].timestamp, records[4].timestamp);
    }
}
