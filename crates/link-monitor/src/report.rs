use crate::{
    Error, Result,
    anomaly::AnomalyFlag,
    record::{Metric, MetricRecord, format_timestamp},
};
use chrono::Utc;
use mockall::automock;
use statrs::statistics::Statistics;
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use tabled::{Table, Tabled, builder::Builder as TableBuilder, settings::Style};
use tracing::info;

/// Consumer invoked with the full history when the monitor stops.
#[automock]
pub trait ReportGenerator: Send + Sync {
    fn generate(&self, history: &[MetricRecord], flags: &[AnomalyFlag]) -> Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Tabled)]
pub struct MetricSummary {
    pub metric: Metric,
    pub samples: usize,
    #[tabled(display = "display_stat")]
    pub mean: f64,
    #[tabled(display = "display_stat")]
    pub min: f64,
    #[tabled(display = "display_stat")]
    pub max: f64,
    pub anomalies: usize,
}

fn display_stat(value: &f64) -> String {
    if value.is_finite() {
        format!("{value:.2}")
    } else {
        "-".to_string()
    }
}

/// Per-metric summary over present values only.
pub fn summarize(history: &[MetricRecord], flags: &[AnomalyFlag]) -> Vec<MetricSummary> {
    Metric::ALL
        .iter()
        .map(|metric| {
            let values: Vec<f64> = history.iter().filter_map(|r| metric.value(r)).collect();
            let (mean, min, max) = if values.is_empty() {
                (f64::NAN, f64::NAN, f64::NAN)
            } else {
                (
                    values.iter().mean(),
                    Statistics::min(values.iter()),
                    Statistics::max(values.iter()),
                )
            };
            MetricSummary {
                metric: *metric,
                samples: values.len(),
                mean,
                min,
                max,
                anomalies: flags.iter().filter(|f| f.metric == *metric).count(),
            }
        })
        .collect()
}

/// Render the summary report as plain text.
pub fn render(history: &[MetricRecord], flags: &[AnomalyFlag]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Link Performance Report");
    let _ = writeln!(out, "Generated: {}", format_timestamp(&Utc::now()));

    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        let _ = writeln!(out, "\nNo measurements recorded.");
        return out;
    };

    let _ = writeln!(
        out,
        "Period: {} .. {} ({} measurements)\n",
        format_timestamp(&first.timestamp),
        format_timestamp(&last.timestamp),
        history.len()
    );

    let summaries = summarize(history, flags);
    let _ = writeln!(
        out,
        "{}\n",
        Table::new(summaries).with(Style::psql().remove_horizontals())
    );

    let classified = history
        .iter()
        .filter(|r| r.predicted_degraded.is_some())
        .count();
    let degraded = history
        .iter()
        .filter(|r| r.predicted_degraded == Some(true))
        .count();
    if classified > 0 {
        let _ = writeln!(
            out,
            "Predicted degraded: {degraded} of {classified} classified measurements\n"
        );
    } else {
        let _ = writeln!(out, "Predicted degraded: no classifier output\n");
    }

    if flags.is_empty() {
        let _ = writeln!(out, "Anomalies: none");
    } else {
        let _ = writeln!(out, "Anomalies:");
        let _ = writeln!(out, "{}", anomaly_table(flags));
    }
    out
}

pub fn anomaly_table(flags: &[AnomalyFlag]) -> String {
    let mut printable = vec![vec![
        "timestamp".to_string(),
        "metric".to_string(),
        "value".to_string(),
        "deviation(σ)".to_string(),
    ]];

    for flag in flags {
        printable.push(vec![
            format_timestamp(&flag.timestamp),
            flag.metric.to_string(),
            format!("{:.3}", flag.value),
            format!("{:+.2}", flag.deviation_sigma),
        ]);
    }

    TableBuilder::from(printable)
        .build()
        .with(Style::psql().remove_horizontals())
        .to_string()
}

/// Writes `link_report_<YYYYmmdd_HHMMSS>.txt` into a directory.
#[derive(Debug, Clone)]
pub struct SummaryReport {
    output_dir: PathBuf,
}

impl SummaryReport {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl ReportGenerator for SummaryReport {
    fn generate(&self, history: &[MetricRecord], flags: &[AnomalyFlag]) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            Error::Report(format!(
                "failed to create {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let path = self.output_dir.join(format!(
            "link_report_{}.txt",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::write(&path, render(history, flags))
            .map_err(|e| Error::Report(format!("failed to write {}: {e}", path.display())))?;

        info!(path = %path.display(), records = history.len(), anomalies = flags.len(), "report generated");
        Ok(path)
    }
}
