use crate::config::BackendConfig;
use crate::error::LaunchError;
use crate::timer::deadline_after;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Counters for backend lifecycle events
#[derive(Debug, Default)]
pub struct LauncherStats {
    starts: AtomicU64,
    stops: AtomicU64,
    startup_failures: AtomicU64,
}

impl LauncherStats {
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn startup_failures(&self) -> u64 {
        self.startup_failures.load(Ordering::SeqCst)
    }
}

/// A spawned backend process
struct BackendProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

/// Owns the backend's process handle: starts it, waits for it to accept
/// connections, and stops it.
///
/// The launcher does no locking of its own. Callers serialize access (the
/// [`Coordinator`](crate::coordinator::Coordinator) keeps it behind its state
/// mutex), which is what guarantees at most one live backend.
///
/// Children are spawned with `kill_on_drop`, so dropping the launcher (or a
/// detached child being reaped) terminates the backend on every exit path.
pub struct ProcessLauncher {
    config: BackendConfig,
    process: Option<BackendProcess>,
    /// Background task escalating SIGTERM to SIGKILL for the last stopped process
    reaper: Option<JoinHandle<()>>,
    stats: Arc<LauncherStats>,
}

impl ProcessLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            process: None,
            reaper: None,
            stats: Arc::new(LauncherStats::default()),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<LauncherStats> {
        Arc::clone(&self.stats)
    }

    /// True iff a process handle is recorded. Liveness is not re-verified;
    /// see [`reap_exited`](Self::reap_exited).
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Spawn the backend with `--port <port>` appended to its arguments and
    /// wait until it accepts TCP connections.
    ///
    /// Fails with [`LaunchError::StartupFailure`] if the process exits while
    /// being probed and with [`LaunchError::ReadinessTimeout`] if the startup
    /// bound expires. In both cases no process is left recorded.
    pub async fn start(&mut self) -> Result<(), LaunchError> {
        if self.process.is_some() {
            debug!("Backend already running");
            return Ok(());
        }

        // The previous process may still be inside its grace period and
        // holding the port.
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }

        let (program, args) = self
            .config
            .argv()
            .map_err(|e| LaunchError::InvalidCommand(e.to_string()))?;

        info!(command = %program, ?args, "Starting backend process");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: program.clone(),
            source,
        })?;
        let pid = child.id();
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        info!(pid, "Backend process spawned");

        self.process = Some(BackendProcess {
            child,
            pid,
            started_at: Instant::now(),
        });

        match self.wait_until_ready().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stats.startup_failures.fetch_add(1, Ordering::SeqCst);
                if let Some(mut process) = self.process.take() {
                    // Already exited for StartupFailure; this only matters on timeout.
                    let _ = process.child.kill().await;
                }
                error!(error = %e, "Backend failed to start");
                Err(e)
            }
        }
    }

    /// Probe the backend address until it accepts a connection
    async fn wait_until_ready(&mut self) -> Result<(), LaunchError> {
        let addr = self.config.target();
        let interval = self.config.probe_interval();
        let probe_timeout = self.config.probe_timeout();
        let deadline = self.config.startup_timeout().map(deadline_after);

        debug!(%addr, interval_ms = interval.as_millis(), "Waiting for backend to accept connections");

        loop {
            if probe(&addr, probe_timeout).await {
                let elapsed = self
                    .process
                    .as_ref()
                    .map(|p| p.started_at.elapsed())
                    .unwrap_or_default();
                info!(
                    pid = self.pid(),
                    startup_ms = elapsed.as_millis(),
                    "Backend is ready"
                );
                return Ok(());
            }

            // A process that has exited can never become connectable.
            let Some(process) = self.process.as_mut() else {
                return Err(LaunchError::StartupFailure { exit_code: None });
            };
            if let Some(status) = process.child.try_wait()? {
                return Err(LaunchError::StartupFailure {
                    exit_code: status.code(),
                });
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let bound = self.config.startup_timeout().unwrap_or_default();
                    return Err(LaunchError::ReadinessTimeout(bound));
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Send a graceful termination signal and forget the process. Returns
    /// false when nothing was running. Does not wait for the process to exit.
    pub fn stop(&mut self) -> bool {
        let Some(process) = self.process.take() else {
            debug!("No backend process to stop");
            return false;
        };

        let BackendProcess { mut child, pid, started_at } = process;
        info!(pid, uptime_secs = started_at.elapsed().as_secs(), "Stopping backend process");
        send_terminate(&mut child);
        self.stats.stops.fetch_add(1, Ordering::SeqCst);

        let grace_period = self.config.shutdown_grace_period();
        self.reaper = Some(tokio::spawn(async move {
            reap(child, pid, grace_period).await;
        }));

        true
    }

    /// Stop the backend and wait until it has exited
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }
    }

    /// Check whether the recorded process has exited on its own. If so, the
    /// handle is cleared and the exit status returned.
    pub fn reap_exited(&mut self) -> Option<ExitStatus> {
        let process = self.process.as_mut()?;
        match process.child.try_wait() {
            Ok(Some(status)) => {
                warn!(pid = process.pid, ?status, "Backend process exited unexpectedly");
                self.process = None;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = process.pid, error = %e, "Failed to check backend process status");
                None
            }
        }
    }
}

/// One readiness probe: can we open a TCP connection to the backend?
async fn probe(target: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

/// Wait for a terminated process to exit, escalating to SIGKILL after the grace period
async fn reap(mut child: Child, pid: Option<u32>, grace_period: Duration) {
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, ?status, "Backend process exited");
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                pid,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
