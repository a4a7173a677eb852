use crate::{Error, Result};
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

/// Transport used by the throughput test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream-oriented (TCP).
    #[default]
    Tcp,
    /// Datagram-oriented (UDP).
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Parameters of a single throughput test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub target: String,
    pub port: u16,
    pub duration: Duration,
    pub parallel: u32,
    pub protocol: Protocol,
    /// Bandwidth cap in iperf3 notation (e.g. "10M"), datagram mode only.
    pub bandwidth: Option<String>,
}

impl TestSpec {
    /// iperf3 client arguments for this test.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.target.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-t".to_string(),
            self.duration.as_secs().max(1).to_string(),
            "-J".to_string(),
        ];
        if self.parallel > 1 {
            args.push("-P".to_string());
            args.push(self.parallel.to_string());
        }
        if self.protocol == Protocol::Udp {
            args.push("-u".to_string());
            if let Some(bandwidth) = &self.bandwidth {
                args.push("-b".to_string());
                args.push(bandwidth.clone());
            }
        }
        args
    }
}

/// One side's aggregate of a finished test.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Summary {
    pub bits_per_second: f64,
    pub retransmits: Option<u64>,
    pub lost_percent: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Parsed test tool output: the received-side and sent-side summaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub sum_received: Option<Summary>,
    pub sum_sent: Option<Summary>,
}

#[derive(Deserialize)]
struct Iperf3Output {
    end: Option<Iperf3End>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Iperf3End {
    sum_received: Option<Summary>,
    sum_sent: Option<Summary>,
}

impl RawResult {
    /// Parse the JSON document printed by `iperf3 -J`.
    pub fn from_json(output: &str) -> Result<Self> {
        let parsed: Iperf3Output = serde_json::from_str(output)
            .map_err(|e| Error::tool(format!("unparsable test output: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(Error::tool(error));
        }

        let end = parsed
            .end
            .ok_or_else(|| Error::tool("test output has no end summary"))?;

        Ok(Self {
            sum_received: end.sum_received,
            sum_sent: end.sum_sent,
        })
    }
}

#[automock]
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run one test. Spawns at most one external process and never retries.
    async fn run(&self, spec: &TestSpec) -> Result<RawResult>;
}

/// Runs the `iperf3` client with a hard wall-clock limit of test duration
/// plus a grace margin.
#[derive(Debug, Clone)]
pub struct Iperf3Runner {
    program: PathBuf,
    grace: Duration,
}

impl Iperf3Runner {
    pub fn new(program: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            grace,
        }
    }

    pub fn time_limit(&self, spec: &TestSpec) -> Duration {
        spec.duration + self.grace
    }
}

#[async_trait]
impl TestRunner for Iperf3Runner {
    async fn run(&self, spec: &TestSpec) -> Result<RawResult> {
        let limit = self.time_limit(spec);
        let args = spec.args();
        debug!(program = %self.program.display(), ?args, ?limit, "spawning test tool");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::tool(format!("failed to spawn {}: {e}", self.program.display()))
            })?;

        let started = Instant::now();
        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| Error::tool(format!("test tool i/o: {e}")))?,
            Err(_) => {
                warn!(host = %spec.target, ?limit, "test tool exceeded its time limit; killed");
                return Err(Error::Timeout { after: limit });
            }
        };
        debug!(elapsed = ?started.elapsed(), status = %output.status, "test tool finished");

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // iperf3 reports its own failures inside the JSON document
            let detail = match RawResult::from_json(&stdout) {
                Err(Error::ToolError { detail }) if !stdout.trim().is_empty() => detail,
                _ => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    format!("exited with {}: {}", output.status, stderr.trim())
                }
            };
            return Err(Error::ToolError { detail });
        }

        RawResult::from_json(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(protocol: Protocol, parallel: u32, bandwidth: Option<&str>) -> TestSpec {
        TestSpec {
            target: "10.0.0.2".to_string(),
            port: 5201,
            duration: Duration::from_secs(5),
            parallel,
            protocol,
            bandwidth: bandwidth.map(str::to_string),
        }
    }

    #[test]
    fn test_args_tcp_single_stream() {
        let args = spec(Protocol::Tcp, 1, Some("10M")).args();
        assert_eq!(
            args,
            vec!["-c", "10.0.0.2", "-p", "5201", "-t", "5", "-J"]
        );
    }

    #[test]
    fn test_args_udp_parallel_with_bandwidth() {
        let args = spec(Protocol::Udp, 4, Some("10M")).args();
        assert_eq!(
            args,
            vec![
                "-c", "10.0.0.2", "-p", "5201", "-t", "5", "-J", "-P", "4", "-u", "-b", "10M"
            ]
        );
    }

    #[test]
    fn test_parse_tcp_output() {
        let json = r#"{
            "start": {"version": "iperf 3.16"},
            "end": {
                "sum_sent": {"bits_per_second": 941000000.0, "retransmits": 12},
                "sum_received": {"bits_per_second": 938000000.0}
            }
        }"#;

        let raw = RawResult::from_json(json).unwrap();
        let received = raw.sum_received.unwrap();
        assert_eq!(received.bits_per_second, 938000000.0);
        assert_eq!(received.retransmits, None);
        assert_eq!(raw.sum_sent.unwrap().retransmits, Some(12));
    }

    #[test]
    fn test_parse_reports_tool_error() {
        let json = r#"{"start": {}, "end": {}, "error": "unable to connect to server: Connection refused"}"#;
        match RawResult::from_json(json) {
            Err(Error::ToolError { detail }) => assert!(detail.contains("Connection refused")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RawResult::from_json("iperf3: error"),
            Err(Error::ToolError { .. })
        ));
        assert!(matches!(
            RawResult::from_json(r#"{"start": {}}"#),
            Err(Error::ToolError { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_error() {
        let runner = Iperf3Runner::new("/nonexistent/iperf3", Duration::from_secs(1));
        let result = runner.run(&spec(Protocol::Tcp, 1, None)).await;
        assert!(matches!(result, Err(Error::ToolError { .. })));
    }

    #[tokio::test]
    async fn test_hung_tool_is_killed_at_time_limit() {
        use std::{fs, os::unix::fs::PermissionsExt};

        let temp_dir = tempfile::TempDir::new().unwrap();
        let program = temp_dir.path().join("iperf3");
        fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let runner = Iperf3Runner::new(&program, Duration::from_millis(300));
        let mut spec = spec(Protocol::Tcp, 1, None);
        spec.duration = Duration::ZERO;

        let started = Instant::now();
        let result = runner.run(&spec).await;

        match result {
            Err(Error::Timeout { after }) => assert_eq!(after, Duration::from_millis(300)),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_time_limit_adds_grace() {
        let runner = Iperf3Runner::new("iperf3", Duration::from_secs(10));
        assert_eq!(
            runner.time_limit(&spec(Protocol::Tcp, 1, None)),
            Duration::from_secs(15)
        );
    }
}
