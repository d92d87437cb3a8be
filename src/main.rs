//! Portkeeper - dev server supervisor
//!
//! Keeps a local dev server bound to a fixed port, restarting it when it
//! dies or stops accepting connections.
//!
//! Environment variables:
//! - `HOST` - Host the server listens on (default: "localhost")
//! - `PORT` - Port to supervise (default: 3900; `SERVER_PORT` is also
//!   accepted)
//!
//! Everything else (child command, poll interval, delays) comes from the
//! config file or the built-in defaults.

use anyhow::Context;
use tracing::{error, info};

use portkeeper::supervisor::Supervisor;
use portkeeper::SupervisorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = portkeeper::init_logging();

    info!("Starting portkeeper");
    if let Some(dir) = portkeeper::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let mut config = SupervisorConfig::load();
    config.apply_env();

    info!(
        "Target: http://{}:{} (child: `{}`)",
        config.host,
        config.port,
        config.command_line()
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut supervisor = Supervisor::new(config);

    // A broken command line should fail loudly up front; once the first
    // spawn has succeeded, failures are retried by the loop instead.
    supervisor
        .start()
        .await
        .context("initial spawn failed")?;

    supervisor.run(shutdown_rx).await;

    info!("Clean shutdown");
    Ok(())
}

/// Resolve on SIGINT (ctrl-c) or, on Unix, SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
