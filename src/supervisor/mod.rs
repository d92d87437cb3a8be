//! Process supervision module
//!
//! Owns the child process and the monitoring loop: initial port
//! reclamation, spawn, periodic liveness checks, and restart-on-failure.

mod errors;
mod monitor;
mod probe;
mod reclaim;

pub use errors::SupervisorError;
pub use monitor::{DesiredState, Supervisor};
pub use probe::{probe_port, PortProbeResult};
pub use reclaim::{platform_reclaimer, PortReclaimer};
