//! Port reclamation
//!
//! Finds and force-kills whatever still holds a listening socket on the
//! target port so the next spawn can bind it. Enumeration and kill go
//! through the OS tools (`lsof`/`ss` plus `kill` on Unix, `netstat` plus
//! `taskkill` on Windows). A failure on one pid never aborts the rest.

use std::process::Command;
use tracing::{debug, info, warn};

/// Platform capability for finding and killing listeners on a port.
///
/// The supervisor depends only on this trait; the concrete implementation
/// is selected once at init time via [`platform_reclaimer`].
pub trait PortReclaimer: Send + Sync {
    /// Pids of processes currently listening on `port`
    fn listeners(&self, port: u16) -> Vec<u32>;

    /// Force-kill `pid`
    fn kill(&self, pid: u32) -> std::io::Result<()>;
}

/// Select the reclaimer for the current platform
pub fn platform_reclaimer() -> Box<dyn PortReclaimer> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsReclaimer)
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(UnixReclaimer)
    }
}

/// Kill every listener on `port`, best-effort.
///
/// Returns the number of killed processes. Calling this on a free port is
/// a no-op: enumeration finds nothing and nothing is killed.
pub(crate) fn reclaim_port(reclaimer: &dyn PortReclaimer, port: u16) -> u32 {
    let pids = reclaimer.listeners(port);
    if pids.is_empty() {
        debug!("No stale listeners on port {}", port);
        return 0;
    }

    let mut killed = 0u32;
    for pid in pids {
        match reclaimer.kill(pid) {
            Ok(()) => {
                info!("Killed stale listener pid {} on port {}", pid, port);
                killed += 1;
            }
            Err(e) => {
                warn!("Failed to kill pid {} on port {}: {}", pid, port, e);
            }
        }
    }
    killed
}

#[cfg(not(target_os = "windows"))]
struct UnixReclaimer;

#[cfg(not(target_os = "windows"))]
impl PortReclaimer for UnixReclaimer {
    fn listeners(&self, port: u16) -> Vec<u32> {
        // lsof is the common case; ss covers minimal environments
        match Command::new("lsof")
            .args(["-t", "-i", &format!("tcp:{}", port), "-s", "tcp:LISTEN"])
            .output()
        {
            Ok(output) => parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                debug!("lsof not available ({}), trying ss", e);
                match Command::new("ss")
                    .args(["-ltnpH", &format!("sport = :{}", port)])
                    .output()
                {
                    Ok(output) => parse_ss_pids(&String::from_utf8_lossy(&output.stdout)),
                    Err(e) => {
                        debug!("Cannot enumerate listeners on port {}: {}", port, e);
                        Vec::new()
                    }
                }
            }
        }
    }

    fn kill(&self, pid: u32) -> std::io::Result<()> {
        let status = Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "kill -9 {} exited with {}",
                pid, status
            )))
        }
    }
}

#[cfg(target_os = "windows")]
struct WindowsReclaimer;

#[cfg(target_os = "windows")]
impl PortReclaimer for WindowsReclaimer {
    fn listeners(&self, port: u16) -> Vec<u32> {
        let output = match Command::new("netstat").args(["-ano"]).output() {
            Ok(o) => o,
            Err(e) => {
                debug!("Cannot enumerate listeners on port {}: {}", port, e);
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut pids = Vec::new();
        for line in stdout.lines() {
            if let Some(pid) = parse_netstat_listener(line, port) {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    fn kill(&self, pid: u32) -> std::io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "taskkill /PID {} exited with {}",
                pid, status
            )))
        }
    }
}

/// Parse `lsof -t` output: one pid per line
#[allow(dead_code)]
fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Extract pids from `ss -ltnp` output lines, e.g.
/// `LISTEN 0 511 *:3900 *:* users:(("node",pid=1234,fd=23))`
#[allow(dead_code)]
fn parse_ss_pids(stdout: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let mut rest = line;
        while let Some(pos) = rest.find("pid=") {
            let after = &rest[pos + 4..];
            let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse::<u32>() {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
            rest = after;
        }
    }
    pids
}

/// Parse one `netstat -ano` line, returning the pid when the line is a
/// LISTENING entry for `port`, e.g.
/// `  TCP    0.0.0.0:3900    0.0.0.0:0    LISTENING    4321`
#[allow(dead_code)]
fn parse_netstat_listener(line: &str, port: u16) -> Option<u32> {
    let mut fields = line.split_whitespace();
    let proto = fields.next()?;
    if !proto.eq_ignore_ascii_case("tcp") {
        return None;
    }
    let local = fields.next()?;
    let _foreign = fields.next()?;
    let state = fields.next()?;
    let pid = fields.next()?;

    if state != "LISTENING" {
        return None;
    }
    if !local.ends_with(&format!(":{}", port)) {
        return None;
    }
    pid.parse().ok()
}
