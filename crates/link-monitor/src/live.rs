//! Periodic terminal snapshot of the most recent measurements.

use crate::{
    anomaly::{AnomalyDetector, AnomalyFlag},
    record::{Metric, MetricRecord, format_timestamp},
    store::MetricsStore,
};
use std::{collections::HashSet, time::Duration};
use tabled::{builder::Builder as TableBuilder, settings::Style};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Appended to a cell whose value was flagged as anomalous.
const ANOMALY_MARKER: &str = " *";

pub struct LiveView {
    store: MetricsStore,
    detector: AnomalyDetector,
    refresh: Duration,
    rows: usize,
}

impl LiveView {
    pub fn new(store: MetricsStore, detector: AnomalyDetector, refresh: Duration, rows: usize) -> Self {
        Self {
            store,
            detector,
            refresh,
            rows,
        }
    }

    /// Re-read the store every `refresh` and log the latest rows until
    /// `shutdown` fires. Read-only; never blocks the writer.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.refresh.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.store.load_all() {
                Ok(history) if history.is_empty() => {
                    info!(store = %self.store.path().display(), "live view: no measurements yet");
                }
                Ok(history) => {
                    let flags = self.detector.detect_all(&history);
                    let table = render(&history, &flags, self.rows);
                    info!(records = history.len(), anomalies = flags.len(), "live view\n{table}");
                }
                Err(err) => warn!(error = %err, "live view failed to read store"),
            }
        }
    }
}

/// Table of the last `rows` records; flagged values carry a marker.
pub fn render(history: &[MetricRecord], flags: &[AnomalyFlag], rows: usize) -> String {
    let start = history.len().saturating_sub(rows);
    let flagged: HashSet<(usize, Metric)> = flags.iter().map(|f| (f.index, f.metric)).collect();

    let mut printable = vec![vec![
        "timestamp".to_string(),
        "throughput_mbps".to_string(),
        "latency_ms".to_string(),
        "jitter_ms".to_string(),
        "lost_percent".to_string(),
        "degraded".to_string(),
    ]];

    for (index, record) in history.iter().enumerate().skip(start) {
        let mut row = vec![format_timestamp(&record.timestamp)];
        for metric in Metric::ALL {
            let mut cell = metric
                .value(record)
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "-".to_string());
            if flagged.contains(&(index, metric)) {
                cell.push_str(ANOMALY_MARKER);
            }
            row.push(cell);
        }
        row.push(match record.predicted_degraded {
            Some(true) => "yes".to_string(),
            Some(false) => "no".to_string(),
            None => "-".to_string(),
        });
        printable.push(row);
    }

    TableBuilder::from(printable)
        .build()
        .with(Style::psql().remove_horizontals())
        .to_string()
}
