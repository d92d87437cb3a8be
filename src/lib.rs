//! Portkeeper
//!
//! Keeps a local development server alive and bound to a fixed TCP port.
//! The supervisor restarts the child process when it dies or stops
//! accepting connections, and reclaims the port from stale listeners
//! before every spawn.

pub mod supervisor;

use std::path::PathBuf;
use tracing::{error, info, warn};

/// Supervisor configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Host the child server is expected to listen on
    pub host: String,
    /// Port the child server is expected to listen on
    pub port: u16,

    /// Child command
    pub command: String,
    /// Child command arguments; `{port}` is replaced with the target port
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child (current directory if unset)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Seconds between liveness checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to wait between reclaiming the port and respawning,
    /// so the OS can release the socket
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    /// Port probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Seconds to wait for the child to exit after a graceful terminate
    /// before force-killing it
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Seconds after a spawn during which a closed port is not treated as
    /// a hung child (the server needs time to bind)
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,

    /// Max restarts before giving up (0 = unlimited)
    #[serde(default)]
    pub max_restarts: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_settle_delay() -> u64 {
    2
}
fn default_probe_timeout() -> u64 {
    1000
}
fn default_grace_period() -> u64 {
    10
}
fn default_startup_grace() -> u64 {
    30
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3900,
            command: "npx".to_string(),
            args: vec![
                "next".to_string(),
                "dev".to_string(),
                "-p".to_string(),
                "{port}".to_string(),
            ],
            working_dir: None,
            poll_interval_secs: default_poll_interval(),
            settle_delay_secs: default_settle_delay(),
            probe_timeout_ms: default_probe_timeout(),
            grace_period_secs: default_grace_period(),
            startup_grace_secs: default_startup_grace(),
            max_restarts: 0,
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("portkeeper").join("logs"))
}

impl SupervisorConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("portkeeper").join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Apply environment variable overrides.
    ///
    /// `HOST` overrides the host; `PORT` (or the legacy `SERVER_PORT`)
    /// overrides the port.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }

        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("SERVER_PORT").ok());
        if let Some(port) = port.and_then(|p| p.parse::<u16>().ok()) {
            self.port = port;
        }
    }

    /// Child argv with `{port}` placeholders substituted
    pub fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{port}", &self.port.to_string()))
            .collect()
    }

    /// Human-readable command line for status output
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.clone())
            .chain(self.resolved_args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Initialize logging (console plus a daily-rolling log file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "portkeeper.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3900);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.settle_delay_secs, 2);
        assert_eq!(config.probe_timeout_ms, 1000);
        assert_eq!(config.max_restarts, 0);
    }

    #[test]
    fn test_resolved_args_substitutes_port() {
        let config = SupervisorConfig {
            port: 4200,
            ..Default::default()
        };
        let args = config.resolved_args();
        assert!(args.contains(&"4200".to_string()));
        assert!(!args.iter().any(|a| a.contains("{port}")));
    }

    #[test]
    fn test_command_line_is_readable() {
        let config = SupervisorConfig::default();
        assert_eq!(config.command_line(), "npx next dev -p 3900");
    }
}
