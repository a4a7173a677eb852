use crate::cli::OutputFormat;
use anyhow::Result;
use clap::Subcommand;
use csv::Writer;
use doublezero_link_monitor::{
    anomaly::AnomalyDetector,
    labeling::export_labeled,
    report::{ReportGenerator, SummaryReport, anomaly_table},
    settings::Settings,
    store::MetricsStore,
};
use std::path::PathBuf;
use tracing::info;

/// Read-only commands over the stored history
#[derive(Subcommand, Debug)]
pub enum InspectCommands {
    /// Generate a summary report from the stored history
    #[command(about = "Write a summary report of the stored history")]
    Report {
        /// Directory for the report file (overrides config file)
        #[arg(short = 'o', long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Print every anomaly in the stored history
    #[command(about = "List anomalies across the stored history")]
    Anomalies {
        #[arg(short = 'f', long, default_value = "table")]
        format: OutputFormat,
    },
    /// Export the history with heuristic degradation labels for training
    #[command(about = "Export a labeled training dataset")]
    Label {
        /// Destination CSV file
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,
    },
}

pub fn handle(settings: &Settings, cmd: InspectCommands) -> Result<()> {
    let store = MetricsStore::new(&settings.store.path);
    let history = store.load_all()?;
    info!(store = %store.path().display(), records = history.len(), "loaded history");

    match cmd {
        InspectCommands::Report { output_dir } => {
            let output_dir = output_dir.unwrap_or_else(|| settings.report.output_dir.clone());
            let flags = AnomalyDetector::default().detect_all(&history);
            let path = SummaryReport::new(output_dir).generate(&history, &flags)?;
            println!("{}", path.display());
        }
        InspectCommands::Anomalies { format } => {
            let flags = AnomalyDetector::default().detect_all(&history);
            match format {
                OutputFormat::Table => println!("{}", anomaly_table(&flags)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&flags)?),
                OutputFormat::Csv => {
                    let mut writer = Writer::from_writer(std::io::stdout());
                    for flag in &flags {
                        writer.serialize(flag)?;
                    }
                    writer.flush()?;
                }
            }
        }
        InspectCommands::Label { output } => {
            let rows = export_labeled(&history, &output)?;
            println!("wrote {rows} labeled rows to {}", output.display());
        }
    }

    Ok(())
}
