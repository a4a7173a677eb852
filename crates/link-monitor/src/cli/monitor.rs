use anyhow::{Result, bail};
use clap::Subcommand;
use doublezero_link_monitor::{
    CycleReport, Orchestrator,
    anomaly::AnomalyDetector,
    classifier::load_classifier,
    live::LiveView,
    report::SummaryReport,
    settings::{Settings, validation::validate_config},
};
use std::{path::PathBuf, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum MonitorCommands {
    /// Run measurement cycles until stopped
    #[command(about = "Start the measurement loop")]
    Run {
        /// Host running the iperf3 server (overrides config file)
        #[clap(short = 't', long, value_name = "HOST")]
        target: Option<String>,

        /// Start-to-start cycle spacing in seconds (overrides config file)
        #[clap(short = 'i', long, value_name = "SECONDS")]
        interval: Option<u64>,

        /// Stop after this many cycles
        #[clap(short = 'n', long, value_name = "N")]
        max_cycles: Option<u64>,

        /// Periodically print the latest measurements
        #[clap(long)]
        live: bool,

        /// Trained degradation model (overrides config file)
        #[clap(short = 'm', long, value_name = "FILE")]
        model: Option<PathBuf>,
    },
    /// Run a single cycle and print the resulting record
    #[command(about = "Run exactly one measurement cycle")]
    Once,
}

pub async fn handle(
    mut settings: Settings,
    cmd: MonitorCommands,
    shutdown: CancellationToken,
) -> Result<()> {
    match cmd {
        MonitorCommands::Run {
            target,
            interval,
            max_cycles,
            live,
            model,
        } => {
            if let Some(target) = target {
                settings.test.target = target;
            }
            if let Some(interval) = interval {
                settings.schedule.interval_secs = interval;
            }
            if max_cycles.is_some() {
                settings.schedule.max_cycles = max_cycles;
            }
            if model.is_some() {
                settings.classifier.model_path = model;
            }
            validate_config(&settings)?;
            run(&settings, live, shutdown).await
        }
        MonitorCommands::Once => {
            settings.schedule.max_cycles = Some(1);
            once(&settings, shutdown).await
        }
    }
}

fn build_orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let classifier = load_classifier(settings.classifier.model_path.as_deref())?;
    Ok(Orchestrator::new(
        settings.orchestrator_config(),
        Box::new(settings.runner()),
        settings.extractor(),
        classifier,
    ))
}

async fn run(settings: &Settings, live: bool, shutdown: CancellationToken) -> Result<()> {
    info!("{settings}");

    let mut orchestrator = build_orchestrator(settings)?;
    if settings.report.on_stop {
        orchestrator = orchestrator
            .with_reporter(Box::new(SummaryReport::new(&settings.report.output_dir)));
    }

    let alerts = tokio::spawn(alert_consumer(orchestrator.subscribe()));

    let consumers = CancellationToken::new();
    let live_view = live.then(|| {
        let view = LiveView::new(
            orchestrator.store(),
            AnomalyDetector::default(),
            Duration::from_secs(settings.live.refresh_secs),
            settings.live.rows,
        );
        tokio::spawn(view.run(consumers.clone()))
    });

    let summary = orchestrator.run(shutdown).await;

    // Dropping the orchestrator closes the event channel
    drop(orchestrator);
    consumers.cancel();
    if let Err(err) = alerts.await {
        warn!(?err, "cycle consumer panicked");
    }
    if let Some(handle) = live_view {
        if let Err(err) = handle.await {
            warn!(?err, "live view panicked");
        }
    }

    let summary = summary?;
    info!(
        cycles = summary.cycles,
        recorded = summary.recorded,
        skipped = summary.skipped,
        "link monitor stopped"
    );
    Ok(())
}

async fn once(settings: &Settings, shutdown: CancellationToken) -> Result<()> {
    let mut orchestrator = build_orchestrator(settings)?;
    let mut events = orchestrator.subscribe();

    let summary = orchestrator.run(shutdown).await?;
    if summary.recorded == 0 {
        bail!("measurement cycle was skipped; see log for the cause");
    }

    let report = events.recv().await?;
    println!("{}", serde_json::to_string_pretty(&report.record)?);
    for flag in &report.record_anomalies {
        println!(
            "anomaly: {} = {:.3} ({:+.2}σ)",
            flag.metric, flag.value, flag.deviation_sigma
        );
    }
    Ok(())
}

/// Print one line per recorded cycle until the channel closes.
async fn alert_consumer(mut events: broadcast::Receiver<CycleReport>) {
    loop {
        match events.recv().await {
            Ok(report) => {
                if report.record.predicted_degraded == Some(true) {
                    warn!(cycle = report.cycle, "link predicted degraded");
                }
                println!("{}", cycle_line(&report));
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "cycle consumer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn cycle_line(report: &CycleReport) -> String {
    let record = &report.record;
    let optional = |value: Option<f64>| {
        value
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".to_string())
    };

    let mut line = format!(
        "#{} throughput={:.2}Mbps latency={}ms jitter={}ms lost={}%",
        report.cycle,
        record.throughput_mbps,
        optional(record.latency_ms),
        optional(record.jitter_ms),
        optional(record.lost_percent),
    );
    if let Some(degraded) = record.predicted_degraded {
        line.push_str(if degraded { " DEGRADED" } else { " ok" });
    }
    for flag in &report.record_anomalies {
        line.push_str(&format!(" [anomaly {} {:+.2}σ]", flag.metric, flag.deviation_sigma));
    }
    line
}
