//! TCP port probing
//!
//! A port counts as in use iff a connection attempt succeeds within the
//! timeout. Every failure mode (refused, timeout, resolution error)
//! collapses to `in_use = false` - probing never fails the caller.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Result of a single port probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProbeResult {
    pub in_use: bool,
}

/// Probe `(host, port)` for a listening socket
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> PortProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => PortProbeResult { in_use: true },
        Ok(Err(e)) => {
            debug!("Port probe {}:{} failed: {}", host, port, e);
            PortProbeResult { in_use: false }
        }
        Err(_) => {
            debug!("Port probe {}:{} timed out", host, port);
            PortProbeResult { in_use: false }
        }
    }
}
