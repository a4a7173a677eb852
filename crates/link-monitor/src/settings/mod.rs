pub mod validation;

use crate::{
    extractor::MetricsExtractor,
    orchestrator::OrchestratorConfig,
    probe::{PingProbe, TcpConnectProbe},
    runner::{Iperf3Runner, Protocol, TestSpec},
};
use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use validation::validate_config;

/// Main settings configuration for the link monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level for application logging (e.g., "info", "debug", "warn", "error")
    pub log_level: String,
    /// Throughput test parameters
    pub test: TestSettings,
    /// Latency probe configuration
    pub probe: ProbeSettings,
    /// Cycle scheduling
    pub schedule: ScheduleSettings,
    /// Metrics history location
    pub store: StoreSettings,
    /// Optional trained degradation model
    pub classifier: ClassifierSettings,
    /// Summary report output
    pub report: ReportSettings,
    /// Live view refresh
    pub live: LiveSettings,
    /// Prometheus exporter (disabled when absent)
    pub metrics: Option<MetricsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Path or name of the iperf3 binary
    pub tool: PathBuf,
    /// Host running the iperf3 server
    pub target: String,
    pub port: u16,
    /// Length of each test in seconds
    pub duration_secs: u64,
    /// Parallel streams (-P)
    pub parallel: u32,
    pub protocol: Protocol,
    /// Bandwidth cap for UDP tests, iperf3 notation (e.g. "10M")
    pub bandwidth: Option<String>,
    /// Added to the test duration to form the hard kill deadline
    pub timeout_grace_secs: u64,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("iperf3"),
            target: "127.0.0.1".to_string(),
            port: 5201,
            duration_secs: 5,
            parallel: 1,
            protocol: Protocol::Tcp,
            bandwidth: None,
            timeout_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// ICMP echo via the system ping binary
    #[default]
    Ping,
    /// TCP handshake time against `probe.port`
    Tcp,
    /// No probe; latency is always absent
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub kind: ProbeKind,
    /// Port for the TCP connect probe
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Ping,
            port: 5201,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Start-to-start spacing of cycles in seconds
    pub interval_secs: u64,
    /// Stop after this many cycles; runs until stopped when unset
    pub max_cycles: Option<u64>,
    /// Extra test attempts within one cycle (default: 0)
    pub max_retries: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_cycles: None,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("link_metrics.csv"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// JSON model artifact; predictions are absent when unset
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub output_dir: PathBuf,
    /// Generate a report when the monitor stops
    pub on_stop: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            on_stop: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    pub refresh_secs: u64,
    /// Most recent records shown per refresh
    pub rows: usize,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            refresh_secs: 2,
            rows: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Prometheus scrape listener, e.g. "0.0.0.0:9090"
    pub addr: SocketAddr,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            test: TestSettings::default(),
            probe: ProbeSettings::default(),
            schedule: ScheduleSettings::default(),
            store: StoreSettings::default(),
            classifier: ClassifierSettings::default(),
            report: ReportSettings::default(),
            live: LiveSettings::default(),
            metrics: None,
        }
    }
}

impl Settings {
    /// Load configuration from a specific config file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Construct settings, env vars take priority still
        let settings = ConfigBuilder::builder()
            .add_source(File::with_name(&path.as_ref().to_string_lossy()))
            .add_source(
                Environment::with_prefix("DZ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        // NOTE: It's ok if this fails (file might not exist)
        let _ = dotenvy::dotenv();

        let settings: Settings = ConfigBuilder::builder()
            .add_source(
                Environment::with_prefix("DZ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    pub fn test_spec(&self) -> TestSpec {
        TestSpec {
            target: self.test.target.clone(),
            port: self.test.port,
            duration: Duration::from_secs(self.test.duration_secs),
            parallel: self.test.parallel,
            protocol: self.test.protocol,
            bandwidth: self.test.bandwidth.clone(),
        }
    }

    pub fn runner(&self) -> Iperf3Runner {
        Iperf3Runner::new(
            self.test.tool.clone(),
            Duration::from_secs(self.test.timeout_grace_secs),
        )
    }

    pub fn extractor(&self) -> MetricsExtractor {
        let timeout = Duration::from_millis(self.probe.timeout_ms);
        match self.probe.kind {
            ProbeKind::Ping => MetricsExtractor::new(Box::new(PingProbe::new(timeout))),
            ProbeKind::Tcp => {
                MetricsExtractor::new(Box::new(TcpConnectProbe::new(self.probe.port, timeout)))
            }
            ProbeKind::None => MetricsExtractor::without_probe(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            test: self.test_spec(),
            store_path: self.store.path.clone(),
            interval: Duration::from_secs(self.schedule.interval_secs),
            max_cycles: self.schedule.max_cycles,
            max_retries: self.schedule.max_retries,
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings {{\n\
             \tLog Level: {}\n\
             \tTarget: {}:{}\n\
             \tProtocol: {} x{} for {}s\n\
             \tProbe: {:?}\n\
             \tInterval: {}s\n\
             \tMax Cycles: {:?}\n\
             \tStore: {}\n\
             \tModel: {:?}\n\
             }}",
            self.log_level,
            self.test.target,
            self.test.port,
            self.test.protocol,
            self.test.parallel,
            self.test.duration_secs,
            self.probe.kind,
            self.schedule.interval_secs,
            self.schedule.max_cycles,
            self.store.path.display(),
            self.classifier.model_path,
        )
    }
}
