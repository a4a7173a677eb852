mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{inspect::InspectCommands, monitor::MonitorCommands};
use doublezero_link_monitor::settings::Settings;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "doublezero-link-monitor",
    about = "Periodic link throughput and latency measurement with anomaly detection",
    version,
    author,
    after_help = r#"Configuration:
    Configuration can be provided via:
    1. Environment variables with DZ__ prefix (e.g., DZ__TEST__TARGET)
    2. .env file in the current directory
    3. Config file with -c option (see config.example.toml)

Examples:
    # Measure a link every 30 seconds until stopped
    doublezero-link-monitor run --target 10.0.0.2 --interval 30

    # Ten cycles with the live table and a trained model
    doublezero-link-monitor run --max-cycles 10 --live --model model.json

    # Print every anomaly in the stored history as JSON
    doublezero-link-monitor anomalies --format json"#
)]
pub struct Cli {
    /// Path to the configuration file (TOML format)
    ///
    /// If not provided, will attempt to load from environment variables
    #[clap(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(flatten)]
    Monitor(MonitorCommands),
    #[command(flatten)]
    Inspect(InspectCommands),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let settings = if let Some(config_path) = &self.config {
            Settings::from_path(config_path)?
        } else {
            Settings::from_env()?
        };
        init_logging(&settings.log_level)?;

        if let Some(metrics) = &settings.metrics {
            PrometheusBuilder::new()
                .with_http_listener(metrics.addr)
                .install()?;
            export_build_info();
            info!(addr = %metrics.addr, "prometheus exporter listening");
        }

        match self.command {
            Commands::Monitor(cmd) => {
                let shutdown = shutdown_listener()?;
                cli::monitor::handle(settings, cmd, shutdown).await
            }
            Commands::Inspect(cmd) => cli::inspect::handle(&settings, cmd),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}

fn init_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn shutdown_listener() -> Result<CancellationToken> {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    Ok(cancellation_token)
}

fn export_build_info() {
    let version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let build_commit = option_env!("BUILD_COMMIT").unwrap_or("UNKNOWN");
    let build_date = option_env!("DATE").unwrap_or("UNKNOWN");
    let pkg_version = env!("CARGO_PKG_VERSION");

    metrics::gauge!(
        "doublezero_link_monitor_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
