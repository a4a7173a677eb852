//! Latency probes. These measure round-trip time over a channel independent
//! of the throughput test and may fail on their own.

use crate::{Error, Result};
use async_trait::async_trait;
use mockall::automock;
use std::{
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, process::Command, time::timeout};
use tracing::debug;

#[automock]
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Round-trip time to `target` in milliseconds.
    async fn probe(&self, target: &str) -> Result<f64>;
}

/// Single ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LatencyProbe for PingProbe {
    async fn probe(&self, target: &str) -> Result<f64> {
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-n", "-c", "1", "-W", &wait_secs, target])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unreachable(target, format!("failed to spawn ping: {e}")))?;

        let limit = self.timeout + Duration::from_secs(1);
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| unreachable(target, "ping timed out"))?
            .map_err(|e| unreachable(target, format!("ping i/o: {e}")))?;

        if !output.status.success() {
            return Err(unreachable(
                target,
                format!("ping exited with {}", output.status),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_rtt(&stdout).ok_or_else(|| unreachable(target, "no reply time in ping output"))
    }
}

/// Time to complete a TCP handshake with `target:port`.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    port: u16,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl LatencyProbe for TcpConnectProbe {
    async fn probe(&self, target: &str) -> Result<f64> {
        let started = Instant::now();
        let stream = timeout(self.timeout, TcpStream::connect((target, self.port)))
            .await
            .map_err(|_| unreachable(target, "connect timed out"))?
            .map_err(|e| unreachable(target, format!("connect: {e}")))?;
        let rtt = started.elapsed();
        drop(stream);

        debug!(host = %target, port = self.port, ?rtt, "tcp connect probe");
        Ok(rtt.as_secs_f64() * 1000.0)
    }
}

fn unreachable(target: &str, detail: impl Into<String>) -> Error {
    Error::ProbeUnreachable {
        target: target.to_string(),
        detail: detail.into(),
    }
}

/// Extract the `time=<ms>` value from ping output.
fn parse_ping_rtt(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("time=")?;
        let value: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        value.parse().ok()
    })
}
