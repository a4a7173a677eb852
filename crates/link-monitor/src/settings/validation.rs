use crate::{
    runner::Protocol,
    settings::{ProbeKind, Settings},
};
use anyhow::{Result, bail};
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Validate the configuration values
pub fn validate_config(settings: &Settings) -> Result<()> {
    // Validate test settings
    if settings.test.target.trim().is_empty() {
        bail!("Test target cannot be empty");
    }

    if settings.test.tool.as_os_str().is_empty() {
        bail!("Test tool path cannot be empty");
    }

    if settings.test.port == 0 {
        bail!("Test port must be greater than 0");
    }

    if settings.test.duration_secs == 0 {
        bail!("Test duration_secs must be greater than 0");
    }

    if settings.test.parallel == 0 {
        bail!("Test parallel must be greater than 0");
    }

    if settings.test.bandwidth.is_some() && settings.test.protocol == Protocol::Tcp {
        warn!(
            bandwidth = ?settings.test.bandwidth,
            "bandwidth cap only applies to udp tests; ignoring"
        );
    }

    // Validate schedule
    if settings.schedule.interval_secs == 0 {
        bail!("Schedule interval_secs must be greater than 0");
    }

    if settings.schedule.max_cycles == Some(0) {
        bail!("Schedule max_cycles must be greater than 0 when set");
    }

    // Validate probe
    if settings.probe.kind != ProbeKind::None && settings.probe.timeout_ms == 0 {
        bail!("Probe timeout_ms must be greater than 0");
    }

    if settings.probe.kind == ProbeKind::Tcp && settings.probe.port == 0 {
        bail!("Probe port must be greater than 0 for tcp probes");
    }

    // Validate store
    if settings.store.path.as_os_str().is_empty() {
        bail!("Store path cannot be empty");
    }

    // Validate live view
    if settings.live.refresh_secs == 0 {
        bail!("Live refresh_secs must be greater than 0");
    }

    if settings.live.rows == 0 {
        bail!("Live rows must be greater than 0");
    }

    // Validate log level
    let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_log_levels.contains(&settings.log_level.to_lowercase().as_str()) {
        bail!(
            "Invalid log level '{}'. Valid options are: {:?}",
            settings.log_level,
            valid_log_levels
        );
    }

    if let Some(metrics) = &settings.metrics {
        if !validate_socket_addr(&metrics.addr) {
            bail!("Invalid SocketAddr: {}", metrics.addr)
        }
    }

    Ok(())
}

fn validate_socket_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ipv4) => !ipv4.is_broadcast() && !ipv4.is_multicast(),
        IpAddr::V6(ipv6) => !ipv6.is_unspecified() && !ipv6.is_multicast(),
    }
}
