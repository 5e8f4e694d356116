//! KNX daemon supervision
//!
//! Owns the external daemon process: spawn, PID-file acquisition with stale
//! detection, layered health probes, and restart with backoff. The probe and
//! monitor loops run in one task tracked by the supervisor; `stop` joins it
//! with a bounded wait and removes the PID file only after the process has
//! exited.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::KnxConfig;
use crate::error::{Error, Result};

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

/// Daemon health as seen by the layered probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonHealth {
    Healthy,
    Degraded,
    Down,
}

/// Optional L3 probe: read a canary group address and report success.
///
/// The bridge implements this against the live daemon socket; the supervisor
/// only cares about the boolean outcome within its timeout.
#[async_trait::async_trait]
pub trait CanaryProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

pub struct DaemonSupervisor {
    config: KnxConfig,
    state_tx: watch::Sender<SupervisorState>,
    health_tx: watch::Sender<DaemonHealth>,
    /// Resolved at acquisition so teardown cannot diverge from creation
    pid_file_path: Mutex<Option<PathBuf>>,
    dstate_count: AtomicU32,
    restart_attempts: AtomicU32,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    canary: Mutex<Option<Arc<dyn CanaryProbe>>>,
}

impl DaemonSupervisor {
    #[must_use]
    pub fn new(config: KnxConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);
        let (health_tx, _) = watch::channel(DaemonHealth::Down);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state_tx,
            health_tx,
            pid_file_path: Mutex::new(None),
            dstate_count: AtomicU32::new(0),
            restart_attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
            shutdown_tx,
            canary: Mutex::new(None),
        })
    }

    /// Install the optional L3 canary probe
    pub async fn set_canary(&self, probe: Arc<dyn CanaryProbe>) {
        *self.canary.lock().await = Some(probe);
    }

    /// Observe lifecycle state changes
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Observe probe-derived health
    #[must_use]
    pub fn health(&self) -> watch::Receiver<DaemonHealth> {
        self.health_tx.subscribe()
    }

    /// Spawn the daemon and start the supervision loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Internal("supervisor already stopped".to_string()));
        }
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            return Ok(());
        }

        self.check_stale_pid_file().await?;

        let supervisor = self.clone();
        *task_slot = Some(tokio::spawn(async move {
            supervisor.run().await;
        }));
        Ok(())
    }

    /// Stop the daemon and join the supervision loop. Idempotent; the wait
    /// is bounded by the restart delay plus a grace period.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.task.lock().await.take() {
            let bound = Duration::from_secs(self.config.restart_delay_secs + 10);
            if tokio::time::timeout(bound, task).await.is_err() {
                tracing::warn!("supervision loop did not stop within bound, detaching");
            }
        }

        // PID file removal strictly after process exit
        self.remove_pid_file().await;
        let _ = self.state_tx.send(SupervisorState::Stopped);
        let _ = self.health_tx.send(DaemonHealth::Down);
        tracing::info!("knx daemon supervisor stopped");
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let _ = self.state_tx.send(SupervisorState::Starting);

            let mut child = match self.spawn_daemon().await {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn knx daemon");
                    if self.register_failure().await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.acquire_pid_file(&child).await {
                tracing::error!(error = %e, "pid file acquisition failed");
                let _ = child.start_kill();
                let _ = child.wait().await;
                if self.register_failure().await {
                    break;
                }
                continue;
            }

            self.dstate_count.store(0, Ordering::SeqCst);
            let _ = self.state_tx.send(SupervisorState::Running);
            let _ = self.health_tx.send(DaemonHealth::Healthy);
            tracing::info!(pid = child.id(), "knx daemon running");

            let pid = child.id();
            let mut probe_interval =
                tokio::time::interval(Duration::from_secs(self.config.health_interval_secs));
            probe_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Do not probe the instant we spawned
            probe_interval.tick().await;

            enum Outcome {
                Exited,
                ForceRestart,
                Shutdown,
            }

            let outcome = loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => {
                                tracing::warn!(code = ?status.code(), "knx daemon exited unexpectedly");
                            }
                            Err(e) => tracing::error!(error = %e, "waiting on knx daemon failed"),
                        }
                        break Outcome::Exited;
                    }
                    _ = probe_interval.tick() => {
                        if !self.run_probes(pid).await {
                            tracing::warn!("forcing knx daemon restart after failed probes");
                            break Outcome::ForceRestart;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break Outcome::Shutdown;
                        }
                    }
                }
            };

            match outcome {
                Outcome::Exited => {}
                Outcome::ForceRestart => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                Outcome::Shutdown => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                    break;
                }
            }

            let _ = self.health_tx.send(DaemonHealth::Down);
            if self.register_failure().await {
                break;
            }
        }
    }

    async fn spawn_daemon(&self) -> Result<Child> {
        Command::new(&self.config.daemon_binary)
            .args(&self.config.daemon_args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ConnectionFailed(format!(
                    "spawn {}: {e}",
                    self.config.daemon_binary.display()
                ))
            })
    }

    /// Count a failure, sleep the restart delay, and report whether the
    /// attempt budget is exhausted.
    async fn register_failure(&self) -> bool {
        let attempts = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.config.max_restart_attempts;
        if max != 0 && attempts >= max {
            tracing::error!(attempts, "knx daemon restart budget exhausted");
            let _ = self.state_tx.send(SupervisorState::Failed);
            return true;
        }
        let _ = self.state_tx.send(SupervisorState::Restarting);
        tokio::time::sleep(Duration::from_secs(self.config.restart_delay_secs)).await;
        false
    }

    // ------------------------------------------------------------------
    // PID file handling
    // ------------------------------------------------------------------

    /// Reject startup if a live daemon owns the PID file; remove stale files.
    async fn check_stale_pid_file(&self) -> Result<()> {
        let path = self.config.pid_file.clone();
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            return Ok(());
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            tracing::warn!(path = %path.display(), "unparseable pid file, removing");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(());
        };

        if process_alive(pid) && comm_matches(pid, &self.config.daemon_binary) {
            return Err(Error::Conflict(format!(
                "knx daemon already running with pid {pid}"
            )));
        }
        tracing::info!(pid, path = %path.display(), "removing stale pid file");
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    /// Write the child's pid with jittered retry and cache the resolved path
    async fn acquire_pid_file(&self, child: &Child) -> Result<()> {
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("child exited before pid capture".to_string()))?;
        let path = self.config.pid_file.clone();

        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut delay = Duration::from_millis(50);
        for attempt in 0..5 {
            match tokio::fs::write(&path, format!("{pid}\n")).await {
                Ok(()) => {
                    *self.pid_file_path.lock().await = Some(path);
                    return Ok(());
                }
                Err(e) if attempt == 4 => {
                    return Err(Error::Internal(format!(
                        "pid file write {}: {e}",
                        path.display()
                    )));
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, "pid file write failed, retrying");
                    let jitter = rand::thread_rng().gen_range(0..50);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("retry loop returns on final attempt");
    }

    async fn remove_pid_file(&self) {
        if let Some(path) = self.pid_file_path.lock().await.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "pid file removal failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Health probes
    // ------------------------------------------------------------------

    /// Run the probe layers. Returns false when a forced restart is needed.
    async fn run_probes(&self, pid: Option<u32>) -> bool {
        let Some(pid) = pid else {
            return false;
        };

        // L1: process alive
        if !process_alive(pid as i32) {
            return false;
        }

        // L2: uninterruptible sleep tolerance
        if in_dstate(pid as i32) {
            let count = self.dstate_count.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(count, "knx daemon in D state");
            let _ = self.health_tx.send(DaemonHealth::Degraded);
            if count >= self.config.dstate_tolerance {
                return false;
            }
            return true;
        }
        self.dstate_count.store(0, Ordering::SeqCst);

        // L3: optional canary read
        if self.config.canary_group_address.is_some() {
            let canary = self.canary.lock().await.clone();
            if let Some(canary) = canary {
                let responded = tokio::time::timeout(Duration::from_secs(5), canary.probe())
                    .await
                    .unwrap_or(false);
                if !responded {
                    tracing::warn!("canary group address did not respond");
                    let _ = self.health_tx.send(DaemonHealth::Degraded);
                    return true;
                }
            }
        }

        // Surviving to a passing probe is what counts as a successful
        // start; only then does the restart budget reset.
        self.restart_attempts.store(0, Ordering::SeqCst);
        let _ = self.health_tx.send(DaemonHealth::Healthy);
        true
    }
}

/// Signal-0 liveness check
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Compare /proc comm against the configured binary's file name
fn comm_matches(pid: i32, binary: &std::path::Path) -> bool {
    let Some(expected) = binary.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match std::fs::read_to_string(format!("/proc/{pid}/comm")) {
        // comm is truncated to 15 characters by the kernel
        Ok(comm) => expected.starts_with(comm.trim()) || comm.trim() == expected,
        Err(_) => false,
    }
}

/// Read the state field of /proc/<pid>/stat; 'D' is uninterruptible sleep
fn in_dstate(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state letter follows the parenthesized comm, which may itself
    // contain spaces and parentheses.
    match stat.rfind(')') {
        Some(idx) => stat[idx + 1..]
            .trim_start()
            .chars()
            .next()
            .is_some_and(|c| c == 'D'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> KnxConfig {
        KnxConfig {
            enabled: true,
            daemon_binary: PathBuf::from("/bin/sleep"),
            daemon_args: vec!["60".to_string()],
            daemon_socket: dir.join("knxd.sock"),
            pid_file: dir.join("knxd.pid"),
            restart_delay_secs: 1,
            max_restart_attempts: 2,
            health_interval_secs: 30,
            dstate_tolerance: 3,
            canary_group_address: None,
        }
    }

    #[tokio::test]
    async fn start_creates_pid_file_and_stop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        supervisor.start().await.unwrap();

        let mut state = supervisor.state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow() != SupervisorState::Running {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("daemon should reach Running");

        let pid_file = dir.path().join("knxd.pid");
        let pid: i32 = tokio::fs::read_to_string(&pid_file)
            .await
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(process_alive(pid));

        supervisor.stop().await;
        assert!(!pid_file.exists());
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        supervisor.start().await.unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(*supervisor.state().borrow(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stale_pid_file_is_removed_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("knxd.pid");
        // A pid that cannot be alive
        tokio::fs::write(&pid_file, "999999999\n").await.unwrap();

        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        supervisor.check_stale_pid_file().await.unwrap();
        assert!(!pid_file.exists());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn unparseable_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("knxd.pid");
        tokio::fs::write(&pid_file, "not-a-pid\n").await.unwrap();

        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        supervisor.check_stale_pid_file().await.unwrap();
        assert!(!pid_file.exists());
        supervisor.stop().await;
    }

    #[test]
    fn dstate_parser_handles_parenthesized_comm() {
        // Not a real /proc read; exercise the parser shape on our own pid,
        // which must not be in D state while running this test.
        let pid = std::process::id() as i32;
        assert!(!in_dstate(pid));
    }

    #[tokio::test]
    async fn restart_budget_leads_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // A command that exits immediately forces restart cycling
        config.daemon_binary = PathBuf::from("/bin/true");
        config.daemon_args = Vec::new();
        config.restart_delay_secs = 0;
        config.max_restart_attempts = 2;

        let supervisor = DaemonSupervisor::new(config);
        supervisor.start().await.unwrap();

        let mut state = supervisor.state();
        tokio::time::timeout(Duration::from_secs(10), async {
            while *state.borrow() != SupervisorState::Failed {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("supervisor should give up after the budget");
        supervisor.stop().await;
    }
}
