use crate::{
    Error, Result,
    anomaly::{AnomalyDetector, AnomalyFlag},
    classifier::DegradationClassifier,
    extractor::MetricsExtractor,
    record::{FeatureVector, Metric, MetricRecord},
    report::ReportGenerator,
    runner::{RawResult, TestRunner, TestSpec},
    store::{MetricsStore, RecordSink, StoreWriter},
};
use backon::{ExponentialBuilder, Retryable};
use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};
use tokio::{
    sync::broadcast,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const MIN_INTERVAL: Duration = Duration::from_millis(1);
const RETRY_MIN_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    Testing,
    Extracting,
    Classifying,
    Persisting,
    Detecting,
    Publishing,
    Stopping,
    Drained,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub test: TestSpec,
    pub store_path: PathBuf,
    /// Start-to-start spacing of cycles.
    pub interval: Duration,
    /// Stop after this many cycles (recorded or skipped).
    pub max_cycles: Option<u64>,
    /// Extra test attempts within a cycle after a failed run.
    pub max_retries: u32,
}

/// Published after every recorded cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub record: MetricRecord,
    /// Flags that point at `record` in this detection pass.
    pub record_anomalies: Vec<AnomalyFlag>,
    /// Flags not present in the previous detection pass.
    pub new_flags: Vec<AnomalyFlag>,
}

/// Totals for one `run` of the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub recorded: u64,
    pub skipped: u64,
}

/// Drives the measurement loop: test, extract, classify, persist, detect and
/// publish, one cycle at a time.
pub struct Orchestrator {
    config: OrchestratorConfig,
    runner: Box<dyn TestRunner>,
    extractor: MetricsExtractor,
    classifier: Box<dyn DegradationClassifier>,
    detector: AnomalyDetector,
    reporter: Option<Box<dyn ReportGenerator>>,
    events: broadcast::Sender<CycleReport>,
    state: OrchestratorState,
    known_flags: HashSet<(usize, Metric)>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runner: Box<dyn TestRunner>,
        extractor: MetricsExtractor,
        classifier: Box<dyn DegradationClassifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            runner,
            extractor,
            classifier,
            detector: AnomalyDetector::default(),
            reporter: None,
            events,
            state: OrchestratorState::Idle,
            known_flags: HashSet::new(),
        }
    }

    /// Report generator invoked once on shutdown.
    pub fn with_reporter(mut self, reporter: Box<dyn ReportGenerator>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.events.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn store(&self) -> MetricsStore {
        MetricsStore::new(&self.config.store_path)
    }

    /// Open (or create) the store and run cycles until `shutdown` fires or
    /// `max_cycles` is reached, then generate the final report.
    ///
    /// Only a store that cannot be opened is an error; every per-cycle failure
    /// is logged and the schedule continues.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunSummary> {
        let mut writer = StoreWriter::open_or_create(&self.config.store_path)?;
        self.seed_known_flags(&writer.reader());
        self.set_state(OrchestratorState::Running);

        info!(
            host = %self.config.test.target,
            protocol = %self.config.test.protocol,
            interval = ?self.config.interval,
            max_cycles = ?self.config.max_cycles,
            classifier = self.classifier.name(),
            "link monitor running"
        );

        let mut ticker = interval(self.config.interval.max(MIN_INTERVAL));
        // A late cycle pushes the schedule back rather than bursting to catch up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("stop requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            summary.cycles += 1;
            let cycle = summary.cycles;
            match self.run_cycle(&mut writer, cycle).await {
                Ok(report) => {
                    summary.recorded += 1;
                    self.publish(report);
                }
                Err(err) => {
                    summary.skipped += 1;
                    warn!(cycle, kind = err.kind(), error = %err, "cycle skipped");
                    metrics::counter!("doublezero_link_monitor_cycle_skipped", "reason" => err.kind())
                        .increment(1);
                }
            }
            self.set_state(OrchestratorState::Running);

            if self
                .config
                .max_cycles
                .is_some_and(|max| summary.cycles >= max)
            {
                info!(cycles = summary.cycles, "reached configured cycle count");
                break;
            }
        }

        self.drain(&writer.reader());
        info!(
            cycles = summary.cycles,
            recorded = summary.recorded,
            skipped = summary.skipped,
            "link monitor drained"
        );
        Ok(summary)
    }

    /// One full cycle. The record is persisted before detection, so an error
    /// returned here means nothing was appended.
    pub async fn run_cycle(
        &mut self,
        writer: &mut dyn RecordSink,
        cycle: u64,
    ) -> Result<CycleReport> {
        self.set_state(OrchestratorState::Testing);
        let started = Instant::now();
        let raw = self.run_test().await?;
        metrics::histogram!("doublezero_link_monitor_test_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.set_state(OrchestratorState::Extracting);
        let mut record = self
            .extractor
            .extract(&raw, &self.config.test.target)
            .await?;

        self.set_state(OrchestratorState::Classifying);
        record.predicted_degraded = self.classifier.predict(&FeatureVector::from(&record));

        self.set_state(OrchestratorState::Persisting);
        if let Some(last) = writer.last_timestamp() {
            if record.timestamp < last {
                warn!(%last, stamped = %record.timestamp, "clock stepped backwards; clamping timestamp");
                record.timestamp = last;
            }
        }
        if let Err(err) = writer.append(&record) {
            error!(cycle, error = %err, "failed to persist record; will retry next cycle");
            metrics::counter!("doublezero_link_monitor_persist_failed").increment(1);
            return Err(err);
        }

        self.set_state(OrchestratorState::Detecting);
        let (record_anomalies, new_flags) = match writer.reader().load_all() {
            Ok(history) => self.annotate(&history),
            Err(err) => {
                warn!(cycle, error = %err, "failed to reload history; skipping detection");
                (Vec::new(), Vec::new())
            }
        };

        Ok(CycleReport {
            cycle,
            record,
            record_anomalies,
            new_flags,
        })
    }

    async fn run_test(&self) -> Result<RawResult> {
        let runner = self.runner.as_ref();
        let spec = &self.config.test;
        let attempts = AtomicUsize::new(0);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_max_delay(RETRY_MAX_DELAY)
            .with_max_times(self.config.max_retries as usize);

        // A timed-out run is never retried; its cycle is skipped
        (|| async move { runner.run(spec).await })
            .retry(backoff)
            .when(|err: &Error| !matches!(err, Error::Timeout { .. }))
            .notify(|err: &Error, delay: Duration| {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(attempt, retry_in = ?delay, error = %err, "test run failed; retrying");
            })
            .await
    }

    /// Detect over the full history and split the flags into those on the
    /// newest record and those not seen in the previous pass.
    fn annotate(&mut self, history: &[MetricRecord]) -> (Vec<AnomalyFlag>, Vec<AnomalyFlag>) {
        let flags = self.detector.detect_all(history);
        let newest = history.len().checked_sub(1);

        let record_anomalies = flags
            .iter()
            .filter(|f| Some(f.index) == newest)
            .cloned()
            .collect();
        let new_flags = flags
            .iter()
            .filter(|f| !self.known_flags.contains(&(f.index, f.metric)))
            .cloned()
            .collect();

        self.known_flags = flags.iter().map(|f| (f.index, f.metric)).collect();
        (record_anomalies, new_flags)
    }

    fn seed_known_flags(&mut self, store: &MetricsStore) {
        match store.load_all() {
            Ok(history) => {
                let _ = self.annotate(&history);
            }
            Err(err) => warn!(error = %err, "failed to read existing history"),
        }
    }

    fn publish(&mut self, report: CycleReport) {
        self.set_state(OrchestratorState::Publishing);

        let record = &report.record;
        info!(
            cycle = report.cycle,
            throughput_mbps = record.throughput_mbps,
            latency_ms = ?record.latency_ms,
            jitter_ms = ?record.jitter_ms,
            lost_percent = ?record.lost_percent,
            predicted_degraded = ?record.predicted_degraded,
            "cycle recorded"
        );
        for flag in &report.new_flags {
            warn!(
                timestamp = %flag.timestamp,
                metric = %flag.metric,
                value = flag.value,
                sigma = flag.deviation_sigma,
                "anomaly detected"
            );
        }

        metrics::counter!("doublezero_link_monitor_cycle_recorded").increment(1);
        metrics::counter!("doublezero_link_monitor_anomalies_flagged")
            .increment(report.new_flags.len() as u64);
        metrics::gauge!("doublezero_link_monitor_throughput_mbps").set(record.throughput_mbps);
        if let Some(latency) = record.latency_ms {
            metrics::gauge!("doublezero_link_monitor_latency_ms").set(latency);
        }
        if record.predicted_degraded == Some(true) {
            metrics::counter!("doublezero_link_monitor_predicted_degraded").increment(1);
        }

        if self.events.send(report).is_err() {
            debug!("no subscribers for cycle report");
        }
    }

    fn drain(&mut self, store: &MetricsStore) {
        self.set_state(OrchestratorState::Stopping);

        if let Some(reporter) = &self.reporter {
            match store.load_all() {
                Ok(history) => {
                    let flags = self.detector.detect_all(&history);
                    if let Err(err) = reporter.generate(&history, &flags) {
                        error!(error = %err, "final report generation failed");
                    }
                }
                Err(err) => error!(error = %err, "failed to load history for final report"),
            }
        }

        self.set_state(OrchestratorState::Drained);
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state transition");
            self.state = state;
        }
    }
}
