//! Child process supervisor
//!
//! Keeps exactly one child process alive and bound to exactly one TCP
//! port. A dead child is respawned after the port is reclaimed; a child
//! that is alive but no longer accepting connections is terminated and
//! respawned. Ticks run strictly sequentially, so at most one
//! spawn/terminate cycle is ever in flight.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::errors::SupervisorError;
use super::probe::{probe_port, PortProbeResult};
use super::reclaim::{platform_reclaimer, reclaim_port, PortReclaimer};
use crate::SupervisorConfig;

/// What the supervisor is currently trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// No live child and none spawned yet (or the last spawn failed;
    /// retried on the next tick)
    Stopped,
    /// A child should be running
    Running,
    /// Shutdown requested; no further spawns
    ShuttingDown,
}

/// Supervisor that owns the child process handle and the target port.
///
/// Invariants: the child handle is `Some` only when the desired state is
/// not `Stopped`, and a previous child is always confirmed terminated
/// before a new one is spawned.
pub struct Supervisor {
    config: SupervisorConfig,
    reclaimer: Box<dyn PortReclaimer>,
    child: Option<Child>,
    desired_state: DesiredState,
    restart_count: u64,
    spawned_at: Option<Instant>,
    announced_ready: bool,
}

impl Supervisor {
    /// Create a supervisor with the platform port reclaimer
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_reclaimer(config, platform_reclaimer())
    }

    /// Create a supervisor with a specific reclaimer (used by tests)
    pub fn with_reclaimer(config: SupervisorConfig, reclaimer: Box<dyn PortReclaimer>) -> Self {
        Self {
            config,
            reclaimer,
            child: None,
            desired_state: DesiredState::Stopped,
            restart_count: 0,
            spawned_at: None,
            announced_ready: false,
        }
    }

    pub fn desired_state(&self) -> DesiredState {
        self.desired_state
    }

    /// Number of restarts performed since startup (the first spawn does
    /// not count)
    pub fn restart_count(&self) -> u64 {
        self.restart_count
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Probe the target port for a listening socket
    pub async fn probe_port(&self) -> PortProbeResult {
        probe_port(
            &self.config.host,
            self.config.port,
            Duration::from_millis(self.config.probe_timeout_ms),
        )
        .await
    }

    /// Kill anything still listening on the target port. Best-effort:
    /// enumeration or kill failures are logged and never fail the caller.
    pub fn reclaim_port(&self) {
        reclaim_port(self.reclaimer.as_ref(), self.config.port);
    }

    /// Launch the child command with stdin/stdout/stderr discarded.
    ///
    /// On failure the supervisor is left with no live child and the next
    /// tick retries.
    pub fn spawn_child(&mut self) -> Result<(), SupervisorError> {
        debug_assert!(self.child.is_none());

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.resolved_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        match cmd.spawn() {
            Ok(child) => {
                if self.restart_count > 0 {
                    info!(
                        "Child started (pid {:?}, restart #{})",
                        child.id(),
                        self.restart_count
                    );
                } else {
                    info!("Child started (pid {:?})", child.id());
                }
                self.child = Some(child);
                self.desired_state = DesiredState::Running;
                self.spawned_at = Some(Instant::now());
                self.announced_ready = false;
                Ok(())
            }
            Err(e) => {
                self.desired_state = DesiredState::Stopped;
                Err(SupervisorError::Spawn(e))
            }
        }
    }

    /// Non-blocking liveness poll on the owned child handle.
    ///
    /// An exited child is reaped and its handle dropped, so the respawn
    /// path never runs with a stale handle in place.
    pub fn is_child_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("Child exited with {}", status);
                self.child = None;
                false
            }
            Err(e) => {
                warn!("Failed to poll child: {}", e);
                self.child = None;
                false
            }
        }
    }

    /// Initial cycle: reclaim the port, wait for it to settle, spawn.
    ///
    /// A failure here is worth surfacing to the entry point for an early,
    /// clear message; later spawn failures only log and retry.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        self.reclaim_port();
        self.settle().await;
        self.spawn_child()
    }

    /// One unit of supervision work.
    ///
    /// Process-liveness is checked before port-liveness: a dead process
    /// never needs a termination step, while a live-but-deaf one does.
    pub async fn monitor_tick(&mut self) {
        if self.desired_state == DesiredState::ShuttingDown {
            return;
        }

        if !self.is_child_alive() {
            if self.restarts_exhausted() {
                return;
            }
            if self.desired_state == DesiredState::Running {
                // A child was live before, so this respawn is a restart
                self.restart_count += 1;
            }
            self.reclaim_port();
            self.settle().await;
            if let Err(e) = self.spawn_child() {
                error!("Spawn failed, retrying next tick: {}", e);
            }
            return;
        }

        // Alive: check the port, but give a fresh server time to bind
        if self.in_startup_grace() {
            return;
        }
        let probe = self.probe_port().await;
        if probe.in_use {
            if !self.announced_ready {
                info!(
                    "Server is up at http://{}:{}",
                    self.config.host, self.config.port
                );
                self.announced_ready = true;
            }
            return;
        }

        if self.restarts_exhausted() {
            return;
        }
        warn!(
            "Child (pid {:?}) is alive but port {} is not accepting connections, restarting",
            self.child_pid(),
            self.config.port
        );
        self.restart_count += 1;
        if let Err(e) = self.restart().await {
            error!("Restart failed, retrying next tick: {}", e);
        }
    }

    /// Terminate the current child and spawn a fresh one on the same
    /// command
    pub async fn restart(&mut self) -> Result<(), SupervisorError> {
        self.terminate_child().await;
        self.reclaim_port();
        self.settle().await;
        self.spawn_child()
    }

    /// Terminate the child, free the port, and mark the supervisor
    /// stopped.
    ///
    /// Idempotent: a second call finds no child handle and an already-free
    /// port. Cleanup is best-effort and never blocks process exit.
    pub async fn shutdown(&mut self) {
        self.desired_state = DesiredState::ShuttingDown;
        self.terminate_child().await;
        self.reclaim_port();
        self.desired_state = DesiredState::Stopped;
        info!("Supervisor stopped");
    }

    /// Run the monitoring loop until shutdown is requested or the restart
    /// cap is exhausted.
    ///
    /// The sleep between ticks is interrupted immediately when
    /// `shutdown_rx` fires; final cleanup always runs before returning.
    pub async fn run(&mut self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!(
            "Supervising `{}` on {}:{} (checking every {}s)",
            self.config.command_line(),
            self.config.host,
            self.config.port,
            self.config.poll_interval_secs
        );

        loop {
            self.monitor_tick().await;
            if self.desired_state == DesiredState::ShuttingDown {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Ask the child to exit gracefully, force-killing after the grace
    /// period
    async fn terminate_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        request_exit(&child);

        let grace = Duration::from_secs(self.config.grace_period_secs);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Child (pid {:?}) exited with {}", pid, status);
            }
            Ok(Err(e)) => {
                warn!("{}", SupervisorError::Terminate(e));
            }
            Err(_) => {
                warn!(
                    "Child (pid {:?}) did not exit within {:?}, force-killing",
                    pid, grace
                );
                if let Err(e) = child.kill().await {
                    warn!("{}", SupervisorError::Terminate(e));
                }
            }
        }
    }

    fn restarts_exhausted(&mut self) -> bool {
        if self.config.max_restarts > 0 && self.restart_count >= self.config.max_restarts {
            error!(
                "Reached max restarts ({}), giving up",
                self.config.max_restarts
            );
            self.desired_state = DesiredState::ShuttingDown;
            true
        } else {
            false
        }
    }

    fn in_startup_grace(&self) -> bool {
        match self.spawned_at {
            Some(at) => at.elapsed() < Duration::from_secs(self.config.startup_grace_secs),
            None => false,
        }
    }

    async fn settle(&self) {
        let delay = Duration::from_secs(self.config.settle_delay_secs);
        if !delay.is_zero() {
            debug!("Waiting {:?} for the port to settle", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Send the child a graceful exit request (SIGTERM on Unix, plain
/// `taskkill` on Windows). The force kill happens later if the grace
/// period runs out.
fn request_exit(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16, command: &str, args: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            host: "127.0.0.1".to_string(),
            port,
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            poll_interval_secs: 1,
            settle_delay_secs: 0,
            probe_timeout_ms: 500,
            grace_period_secs: 5,
            startup_grace_secs: 0,
            max_restarts: 0,
        }
    }

    /// Reclaimer that never finds anything, so tests cannot kill real
    /// processes on a shared machine
    struct NoopReclaimer;

    impl PortReclaimer for NoopReclaimer {
        fn listeners(&self, _port: u16) -> Vec<u32> {
            Vec::new()
        }
        fn kill(&self, _pid: u32) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_child() {
        let config = test_config(free_port(), "definitely-not-a-real-command-xyz", &[]);
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        assert!(sup.spawn_child().is_err());
        assert_eq!(sup.desired_state(), DesiredState::Stopped);
        assert!(!sup.is_child_alive());
        assert!(sup.child_pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_healthy_child_is_not_restarted() {
        // The test listener stands in for the child's listening socket
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = test_config(port, "sleep", &["60"]);
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        assert!(sup.is_child_alive());
        let pid = sup.child_pid();

        sup.monitor_tick().await;
        assert_eq!(sup.child_pid(), pid);
        assert_eq!(sup.restart_count(), 0);
        assert_eq!(sup.desired_state(), DesiredState::Running);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_child_respawned_exactly_once_per_tick() {
        let config = test_config(free_port(), "true", &[]);
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sup.is_child_alive());

        sup.monitor_tick().await;
        assert_eq!(sup.restart_count(), 1);
        assert!(sup.child_pid().is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.monitor_tick().await;
        assert_eq!(sup.restart_count(), 2);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_child_is_restarted() {
        // Child stays alive but never listens on the port
        let config = test_config(free_port(), "sleep", &["60"]);
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        let old_pid = sup.child_pid();
        assert!(sup.is_child_alive());

        sup.monitor_tick().await;
        assert_eq!(sup.restart_count(), 1);
        assert!(sup.is_child_alive());
        assert_ne!(sup.child_pid(), old_pid);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_grace_suppresses_port_check() {
        let mut config = test_config(free_port(), "sleep", &["60"]);
        config.startup_grace_secs = 60;
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        let pid = sup.child_pid();

        // Port is closed, but the child was just spawned
        sup.monitor_tick().await;
        assert_eq!(sup.restart_count(), 0);
        assert_eq!(sup.child_pid(), pid);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let config = test_config(free_port(), "sleep", &["60"]);
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        sup.shutdown().await;
        assert_eq!(sup.desired_state(), DesiredState::Stopped);
        assert!(sup.child_pid().is_none());

        sup.shutdown().await;
        assert_eq!(sup.desired_state(), DesiredState::Stopped);
        assert!(sup.child_pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_max_restarts_triggers_shutdown() {
        let mut config = test_config(free_port(), "true", &[]);
        config.max_restarts = 1;
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        sup.spawn_child().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.monitor_tick().await;
        assert_eq!(sup.restart_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.monitor_tick().await;
        assert_eq!(sup.desired_state(), DesiredState::ShuttingDown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_signal_interrupts_sleep() {
        let mut config = test_config(free_port(), "sleep", &["60"]);
        config.poll_interval_secs = 60;
        config.startup_grace_secs = 60;
        let mut sup = Supervisor::with_reclaimer(config, Box::new(NoopReclaimer));

        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        sup.run(rx).await;

        // Must not wait out the 60s poll interval
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(sup.desired_state(), DesiredState::Stopped);
        assert!(sup.child_pid().is_none());
    }
}
