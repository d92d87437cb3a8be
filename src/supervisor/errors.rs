//! Supervisor error types

use thiserror::Error;

/// Errors raised while managing the child process.
///
/// All variants are handled inside the supervisor loop; only a failure of
/// the very first spawn surfaces to the entry point. Port probe failures
/// are not errors at all - they collapse to "port not in use".
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to terminate child process: {0}")]
    Terminate(#[source] std::io::Error),
}
