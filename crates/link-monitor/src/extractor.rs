use crate::{
    Error, Result,
    probe::LatencyProbe,
    record::MetricRecord,
    runner::{RawResult, Summary},
};
use chrono::Utc;
use tracing::{debug, warn};

const BITS_PER_MEGABIT: f64 = 1e6;

/// Normalizes a raw test result plus a latency probe into a [`MetricRecord`].
pub struct MetricsExtractor {
    probe: Option<Box<dyn LatencyProbe>>,
}

impl MetricsExtractor {
    pub fn new(probe: Box<dyn LatencyProbe>) -> Self {
        Self { probe: Some(probe) }
    }

    /// Extractor that records every latency as absent.
    pub fn without_probe() -> Self {
        Self { probe: None }
    }

    pub async fn extract(&self, raw: &RawResult, target: &str) -> Result<MetricRecord> {
        let summary = authoritative_summary(raw)?;
        // Only the sender counts TCP retransmits
        let sent = raw.sum_sent.as_ref();

        if !summary.bits_per_second.is_finite() || summary.bits_per_second < 0.0 {
            return Err(Error::tool(format!(
                "invalid throughput: {} bits/s",
                summary.bits_per_second
            )));
        }

        let latency_ms = match &self.probe {
            Some(probe) => match probe.probe(target).await {
                Ok(rtt) => Some(rtt),
                Err(err) => {
                    warn!(host = %target, ?err, "latency probe failed; recording latency as absent");
                    metrics::counter!("doublezero_link_monitor_probe_failed").increment(1);
                    None
                }
            },
            None => None,
        };

        let record = MetricRecord {
            timestamp: Utc::now(),
            throughput_mbps: summary.bits_per_second / BITS_PER_MEGABIT,
            retransmits: summary
                .retransmits
                .or_else(|| sent.and_then(|s| s.retransmits)),
            lost_percent: summary
                .lost_percent
                .or_else(|| sent.and_then(|s| s.lost_percent)),
            jitter_ms: summary.jitter_ms.or_else(|| sent.and_then(|s| s.jitter_ms)),
            latency_ms,
            predicted_degraded: None,
        };
        debug!(?record, "extracted metrics");

        Ok(record)
    }
}

/// The received side reflects what actually arrived, so its throughput wins
/// when both summaries are present.
fn authoritative_summary(raw: &RawResult) -> Result<&Summary> {
    raw.sum_received
        .as_ref()
        .or(raw.sum_sent.as_ref())
        .ok_or_else(|| Error::tool("test result has neither a received nor a sent summary"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockLatencyProbe;

    fn summary(bps: f64) -> Summary {
        Summary {
            bits_per_second: bps,
            retransmits: None,
            lost_percent: None,
            jitter_ms: None,
        }
    }

    #[tokio::test]
    async fn test_received_summary_wins_with_sent_filling_gaps() {
        let raw = RawResult {
            sum_received: Some(Summary {
                lost_percent: Some(0.0),
                jitter_ms: Some(0.31),
                ..summary(90e6)
            }),
            sum_sent: Some(Summary {
                retransmits: Some(7),
                lost_percent: Some(4.0),
                ..summary(100e6)
            }),
        };

        let mut probe = MockLatencyProbe::new();
        probe.expect_probe().returning(|_| Ok(3.5));

        let record = MetricsExtractor::new(Box::new(probe))
            .extract(&raw, "10.0.0.2")
            .await
            .unwrap();

        assert_eq!(record.throughput_mbps, 90.0);
        assert_eq!(record.retransmits, Some(7));
        assert_eq!(record.lost_percent, Some(0.0));
        assert_eq!(record.jitter_ms, Some(0.31));
        assert_eq!(record.latency_ms, Some(3.5));
        assert_eq!(record.predicted_degraded, None);
    }

    #[tokio::test]
    async fn test_tcp_output_keeps_sender_retransmits() {
        let json = r#"{
            "end": {
                "sum_sent": {"bits_per_second": 941000000.0, "retransmits": 12},
                "sum_received": {"bits_per_second": 938000000.0}
            }
        }"#;
        let raw = RawResult::from_json(json).unwrap();

        let record = MetricsExtractor::without_probe()
            .extract(&raw, "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(record.throughput_mbps, 938.0);
        assert_eq!(record.retransmits, Some(12));
        assert_eq!(record.jitter_ms, None);
    }

    #[tokio::test]
    async fn test_falls_back_to_sent_summary() {
        let raw = RawResult {
            sum_received: None,
            sum_sent: Some(Summary {
                retransmits: Some(0),
                ..summary(250e6)
            }),
        };

        let record = MetricsExtractor::without_probe()
            .extract(&raw, "10.0.0.2")
            .await
            .unwrap();

        assert_eq!(record.throughput_mbps, 250.0);
        assert_eq!(record.retransmits, Some(0));
        assert_eq!(record.latency_ms, None);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_latency_absent() {
        let raw = RawResult {
            sum_received: Some(summary(10e6)),
            sum_sent: None,
        };

        let mut probe = MockLatencyProbe::new();
        probe
            .expect_probe()
            .withf(|target| target == "10.0.0.2")
            .times(1)
            .returning(|target| {
                Err(Error::ProbeUnreachable {
                    target: target.to_string(),
                    detail: "timeout".to_string(),
                })
            });

        let record = MetricsExtractor::new(Box::new(probe))
            .extract(&raw, "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(record.latency_ms, None);
        assert_eq!(record.throughput_mbps, 10.0);
    }

    #[tokio::test]
    async fn test_no_summary_is_tool_error() {
        let result = MetricsExtractor::without_probe()
            .extract(&RawResult::default(), "10.0.0.2")
            .await;
        assert!(matches!(result, Err(Error::ToolError { .. })));
    }

    #[tokio::test]
    async fn test_zero_throughput_is_kept() {
        let raw = RawResult {
            sum_received: Some(summary(0.0)),
            sum_sent: None,
        };
        let record = MetricsExtractor::without_probe()
            .extract(&raw, "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(record.throughput_mbps, 0.0);
    }
}
