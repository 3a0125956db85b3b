//! Backend process registry and lifecycle supervision
//!
//! The registry owns one backend process slot per route. Every spawned child
//! is handed to a dedicated watcher task that owns the `Child` handle,
//! confirms the backend is listening, awaits exit, and drives crash-restart
//! with bounded exponential backoff. The watcher is the single writer for a
//! route's state transitions; the router only reads.

use crate::config::{Config, Route, RouteDefaults};
use crate::error::Error;
use crate::ports::PortAllocator;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Extra time stop() waits beyond the grace period for the watcher to
/// confirm exit (covers the SIGKILL fallback)
const EXIT_CONFIRM_SLACK: Duration = Duration::from_secs(2);

/// State of a route's backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Registered, never spawned
    Pending,
    /// Spawned, waiting for the listening confirmation probe
    Starting,
    /// Confirmed listening and accepting traffic
    Running,
    /// Explicitly stopped; terminal
    Stopped,
    /// Exited unexpectedly; a restart is pending
    Crashed,
    /// Restart budget exhausted; terminal, never retried
    Failed,
}

/// Registry slot for one route's backend
struct BackendEntry {
    route: Route,
    port: Option<u16>,
    state: ProcessState,
    pid: Option<u32>,
    failures: u32,
    started_at: Option<Instant>,
    /// Fires when the backend transitions to Running
    ready_tx: broadcast::Sender<()>,
    /// Requests a graceful stop from the watcher owning the child
    stop_tx: Option<watch::Sender<bool>>,
    /// Resolved by the watcher once the child has fully exited
    exited_rx: Option<watch::Receiver<bool>>,
}

/// Snapshot of a route's backend for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub route: String,
    pub title: Option<String>,
    pub state: ProcessState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub failures: u32,
    pub uptime_secs: Option<u64>,
    pub active_sessions: u32,
}

/// Owns all backend processes and their state transitions.
///
/// Designed to be shared behind an `Arc`: [`new`](ProcessManager::new)
/// returns `Arc<Self>` directly, and methods that spawn watcher tasks take
/// `&Arc<Self>`.
pub struct ProcessManager {
    /// Routes in declaration order, for status output
    routes: Vec<Route>,
    defaults: RouteDefaults,
    entries: DashMap<String, Mutex<BackendEntry>>,
    ports: PortAllocator,
    /// Provisioned terminal binary, used by routes without a command
    backend_binary: Option<PathBuf>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessManager {
    /// Build the registry and allocate ports for every route.
    ///
    /// Port exhaustion is fatal only for the affected route: it is registered
    /// in terminal Failed state and other routes proceed.
    pub fn new(
        config: &Config,
        backend_binary: Option<PathBuf>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let ports = PortAllocator::new(config.defaults.base_port, config.defaults.port_probe_limit);
        let entries = DashMap::new();

        for route in &config.routes {
            let (port, state) = match ports.allocate(route) {
                Ok(port) => (Some(port), ProcessState::Pending),
                Err(e) => {
                    error!(route = %route.path, error = %e, "Port allocation failed, route disabled");
                    (None, ProcessState::Failed)
                }
            };
            let (ready_tx, _) = broadcast::channel(16);
            entries.insert(
                route.path.clone(),
                Mutex::new(BackendEntry {
                    route: route.clone(),
                    port,
                    state,
                    pid: None,
                    failures: 0,
                    started_at: None,
                    ready_tx,
                    stop_tx: None,
                    exited_rx: None,
                }),
            );
        }

        Arc::new(Self {
            routes: config.routes.clone(),
            defaults: config.defaults.clone(),
            entries,
            ports,
            backend_binary,
            shutdown_rx,
        })
    }

    pub fn defaults(&self) -> &RouteDefaults {
        &self.defaults
    }

    /// Routes in declaration order
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route(&self, path: &str) -> Option<Route> {
        self.entries.get(path).map(|e| e.lock().route.clone())
    }

    pub fn state(&self, path: &str) -> ProcessState {
        self.entries
            .get(path)
            .map(|e| e.lock().state)
            .unwrap_or(ProcessState::Pending)
    }

    pub fn is_running(&self, path: &str) -> bool {
        self.state(path) == ProcessState::Running
    }

    /// Allocated backend port for a route
    pub fn port(&self, path: &str) -> Option<u16> {
        self.entries.get(path).and_then(|e| e.lock().port)
    }

    /// Receiver notified when the route's backend reaches Running
    pub fn subscribe_ready(&self, path: &str) -> Option<broadcast::Receiver<()>> {
        self.entries
            .get(path)
            .map(|e| e.lock().ready_tx.subscribe())
    }

    /// Spawn backends for every route not configured for lazy start
    pub async fn start_all(self: &Arc<Self>) {
        let eager: Vec<String> = self
            .routes
            .iter()
            .filter(|r| !r.lazy_start(&self.defaults))
            .map(|r| r.path.clone())
            .collect();

        info!(count = eager.len(), "Starting backends");
        for path in eager {
            if let Err(e) = self.spawn(&path).await {
                error!(route = %path, error = %e, "Failed to start backend");
            }
        }
    }

    /// Spawn the backend for a route.
    ///
    /// Idempotent while the backend is Starting or Running. Terminal routes
    /// (Stopped, Failed) are never respawned through this path.
    pub async fn spawn(self: &Arc<Self>, path: &str) -> Result<(), Error> {
        let (route, port, stop_rx, exited_tx) = {
            let entry = self.entries.get(path).ok_or_else(|| {
                Error::configuration(format!("unknown route: {}", path))
            })?;
            let mut guard = entry.lock();
            match guard.state {
                ProcessState::Starting | ProcessState::Running => {
                    debug!(route = %path, "Backend already starting or running");
                    return Ok(());
                }
                ProcessState::Stopped | ProcessState::Failed => {
                    return Err(Error::ProcessCrash {
                        route: path.to_string(),
                    });
                }
                ProcessState::Pending | ProcessState::Crashed => {}
            }
            let port = guard.port.ok_or(Error::PortExhaustion {
                route: path.to_string(),
                probes: 0,
            })?;
            // Claim the slot before releasing the lock so concurrent spawn
            // calls observe Starting and return early. The control channels
            // are registered under the same lock: a stop() that lands while
            // the child is still being spawned signals stop_tx, and the
            // watcher picks the pending value up as soon as it starts.
            guard.state = ProcessState::Starting;
            guard.started_at = Some(Instant::now());
            let (stop_tx, stop_rx) = watch::channel(false);
            let (exited_tx, exited_rx) = watch::channel(false);
            guard.stop_tx = Some(stop_tx);
            guard.exited_rx = Some(exited_rx);
            (guard.route.clone(), port, stop_rx, exited_tx)
        };

        let mut cmd = match self.build_command(&route, port) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.handle_exit(path, port, &exited_tx);
                return Err(e);
            }
        };

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(route = %path, error = %e, "Backend spawn failed");
                self.handle_exit(path, port, &exited_tx);
                return Err(Error::ProcessSpawn {
                    route: path.to_string(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        info!(route = %path, port, pid, "Backend process spawned");

        if let Some(entry) = self.entries.get(path) {
            entry.lock().pid = pid;
        }

        let manager = Arc::clone(self);
        let path_owned = path.to_string();
        tokio::spawn(async move {
            manager
                .watch_backend(path_owned, port, child, stop_rx, exited_tx)
                .await;
        });

        Ok(())
    }

    /// Resolve the command line and environment for a route's backend
    fn build_command(&self, route: &Route, port: u16) -> Result<Command, Error> {
        let parent: HashMap<String, String> = std::env::vars().collect();
        let env = route.env.resolve(&parent);

        let mut cmd = match &route.command {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.args(&route.args);
                cmd
            }
            None => {
                let binary = self.backend_binary.as_ref().ok_or_else(|| {
                    Error::Provisioning(format!(
                        "route {} has no command and no backend binary was provisioned",
                        route.path
                    ))
                })?;
                let mut cmd = Command::new(binary);
                cmd.arg("-p").arg(port.to_string());
                cmd.arg("-i").arg("127.0.0.1");
                if !route.theme.is_empty() {
                    let theme_json = serde_json::to_string(&route.theme)
                        .map_err(|e| Error::configuration(format!("bad theme: {}", e)))?;
                    cmd.arg("-t").arg(format!("theme={}", theme_json));
                }
                cmd.args(&route.args);
                cmd
            }
        };

        cmd.env_clear();
        cmd.envs(env);
        // Backends listen on the allocated port by convention
        cmd.env("PORT", port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        Ok(cmd)
    }

    /// Watch one spawned child: confirm it is listening, then await exit or
    /// a stop request. Runs until the child is gone.
    async fn watch_backend(
        self: Arc<Self>,
        path: String,
        port: u16,
        mut child: Child,
        mut stop_rx: watch::Receiver<bool>,
        exited_tx: watch::Sender<bool>,
    ) {
        let (startup_timeout, probe_interval, grace) = {
            let route = match self.route(&path) {
                Some(r) => r,
                None => return,
            };
            (
                route.startup_timeout(&self.defaults),
                self.defaults.probe_interval(),
                route.grace_period(&self.defaults),
            )
        };
        let mut shutdown_rx = self.shutdown_rx.clone();

        drain_output(&path, &mut child);

        enum Event {
            Exited(Option<std::process::ExitStatus>),
            StopRequested,
            ProbeTick,
        }

        // Phase 1: wait for the backend to start listening
        let started = Instant::now();
        loop {
            let event = tokio::select! {
                status = child.wait() => Event::Exited(status.ok()),
                _ = stop_rx.changed() => Event::StopRequested,
                _ = shutdown_rx.changed() => Event::StopRequested,
                _ = tokio::time::sleep(probe_interval) => Event::ProbeTick,
            };

            match event {
                Event::Exited(status) => {
                    warn!(route = %path, ?status, "Backend exited before confirming listen");
                    self.handle_exit(&path, port, &exited_tx);
                    return;
                }
                Event::StopRequested => {
                    self.graceful_stop(&path, &mut child, grace, &exited_tx).await;
                    return;
                }
                Event::ProbeTick => {
                    if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                        break;
                    }
                    if started.elapsed() > startup_timeout {
                        warn!(
                            route = %path,
                            port,
                            timeout_secs = startup_timeout.as_secs(),
                            "Backend did not start listening in time"
                        );
                        terminate_child(&path, &mut child, grace).await;
                        self.handle_exit(&path, port, &exited_tx);
                        return;
                    }
                }
            }
        }

        self.mark_running(&path);

        // Phase 2: the backend is serving; wait for exit or stop
        let event = tokio::select! {
            status = child.wait() => Event::Exited(status.ok()),
            _ = stop_rx.changed() => Event::StopRequested,
            _ = shutdown_rx.changed() => Event::StopRequested,
        };

        match event {
            Event::Exited(status) => {
                warn!(route = %path, ?status, "Backend exited unexpectedly");
                self.handle_exit(&path, port, &exited_tx);
            }
            Event::StopRequested | Event::ProbeTick => {
                self.graceful_stop(&path, &mut child, grace, &exited_tx).await;
            }
        }
    }

    fn mark_running(&self, path: &str) {
        if let Some(entry) = self.entries.get(path) {
            let mut guard = entry.lock();
            if guard.state == ProcessState::Starting {
                guard.state = ProcessState::Running;
                guard.failures = 0;
                let _ = guard.ready_tx.send(());
                info!(route = %path, port = guard.port, "Backend is running");
            }
        }
    }

    /// Record an unexpected exit and apply the restart policy.
    ///
    /// The backoff wait and respawn run on their own task so neither the
    /// watcher nor a failed spawn call blocks on the delay.
    fn handle_exit(self: &Arc<Self>, path: &str, port: u16, exited_tx: &watch::Sender<bool>) {
        let _ = exited_tx.send(true);

        let (failures, max_retries) = {
            let entry = match self.entries.get(path) {
                Some(e) => e,
                None => return,
            };
            let mut guard = entry.lock();
            if guard.state == ProcessState::Stopped {
                // Exit observed during an explicit stop; nothing to restart
                return;
            }
            guard.pid = None;
            guard.failures += 1;
            let max_retries = guard.route.max_retries(&self.defaults);
            if guard.failures > max_retries {
                guard.state = ProcessState::Failed;
            } else {
                guard.state = ProcessState::Crashed;
            }
            (guard.failures, max_retries)
        };

        if failures > max_retries {
            error!(
                route = %path,
                failures,
                max_retries,
                "Restart budget exhausted, route is now permanently unavailable"
            );
            self.ports.release(port);
            return;
        }

        let delay = backoff_delay(&self.defaults, failures);
        warn!(
            route = %path,
            failures,
            delay_ms = delay.as_millis() as u64,
            "Backend crashed, restart scheduled"
        );

        let manager = Arc::clone(self);
        let path = path.to_string();
        tokio::spawn(async move {
            let mut shutdown_rx = manager.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }

            // An explicit stop during the backoff wins over the restart
            if manager.state(&path) != ProcessState::Crashed {
                return;
            }
            if let Err(e) = manager.spawn(&path).await {
                error!(route = %path, error = %e, "Restart attempt failed");
            }
        });
    }

    async fn graceful_stop(
        &self,
        path: &str,
        child: &mut Child,
        grace: Duration,
        exited_tx: &watch::Sender<bool>,
    ) {
        if let Some(entry) = self.entries.get(path) {
            let mut guard = entry.lock();
            guard.state = ProcessState::Stopped;
            guard.pid = None;
        }
        terminate_child(path, child, grace).await;
        let _ = exited_tx.send(true);
    }

    /// Stop a route's backend. Idempotent; returns once the process has
    /// confirmed exit (or the bounded wait expired) and the port is
    /// released.
    pub async fn stop(&self, path: &str) {
        let (exited_rx, port, grace) = {
            let entry = match self.entries.get(path) {
                Some(e) => e,
                None => return,
            };
            let mut guard = entry.lock();
            match guard.state {
                ProcessState::Stopped | ProcessState::Failed => return,
                ProcessState::Pending | ProcessState::Crashed => {
                    // No live process to signal
                    guard.state = ProcessState::Stopped;
                    let port = guard.port;
                    drop(guard);
                    if let Some(port) = port {
                        self.ports.release(port);
                    }
                    return;
                }
                ProcessState::Starting | ProcessState::Running => {}
            }
            guard.state = ProcessState::Stopped;
            let grace = guard.route.grace_period(&self.defaults);
            if let Some(tx) = &guard.stop_tx {
                let _ = tx.send(true);
            }
            (guard.exited_rx.clone(), guard.port, grace)
        };

        if let Some(mut rx) = exited_rx {
            let deadline = grace + EXIT_CONFIRM_SLACK;
            let confirmed = tokio::time::timeout(deadline, async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .is_ok();

            if confirmed {
                info!(route = %path, "Backend stopped");
            } else {
                warn!(route = %path, "Backend did not confirm exit within the deadline");
            }
        }

        // Exit is confirmed (or abandoned past the bounded wait); only now
        // may the port be reused.
        if let Some(port) = port {
            self.ports.release(port);
        }
    }

    /// Stop every backend concurrently, bounded by the shutdown deadline.
    ///
    /// Lingering processes are logged, never waited on forever; registry
    /// state is cleaned up regardless.
    pub async fn stop_all(&self) {
        let paths: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        info!(count = paths.len(), "Stopping all backends");

        let stops = paths.iter().map(|p| self.stop(p));
        let deadline = self.defaults.shutdown_deadline();
        if tokio::time::timeout(deadline, futures::future::join_all(stops))
            .await
            .is_err()
        {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Shutdown deadline exceeded with backends still stopping"
            );
        }

        info!("All backends stopped");
    }

    /// Stop and respawn one route, resetting its failure budget
    pub async fn restart(self: &Arc<Self>, path: &str) -> Result<(), Error> {
        info!(route = %path, "Restarting backend");
        self.stop(path).await;
        {
            let entry = self.entries.get(path).ok_or_else(|| {
                Error::configuration(format!("unknown route: {}", path))
            })?;
            let mut guard = entry.lock();
            guard.state = ProcessState::Pending;
            guard.failures = 0;
            // Reclaim the released port (or a fresh one if it was taken)
            let route = guard.route.clone();
            drop(guard);
            let port = self.ports.allocate(&route)?;
            entry.lock().port = Some(port);
        }
        self.spawn(path).await
    }

    /// Snapshot of every route's backend, in declaration order
    pub fn statuses(&self, sessions: impl Fn(&str) -> u32) -> Vec<BackendStatus> {
        self.routes
            .iter()
            .filter_map(|route| {
                let entry = self.entries.get(&route.path)?;
                let guard = entry.lock();
                Some(BackendStatus {
                    route: route.path.clone(),
                    title: route.title.clone(),
                    state: guard.state,
                    port: guard.port,
                    pid: guard.pid,
                    failures: guard.failures,
                    uptime_secs: match guard.state {
                        ProcessState::Running => {
                            guard.started_at.map(|t| t.elapsed().as_secs())
                        }
                        _ => None,
                    },
                    active_sessions: sessions(&route.path),
                })
            })
            .collect()
    }
}

/// Exponential backoff: base doubling per failure, capped
fn backoff_delay(defaults: &RouteDefaults, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = defaults
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(defaults.backoff_cap_ms);
    Duration::from_millis(delay)
}

/// SIGTERM, grace period, then SIGKILL
async fn terminate_child(path: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        debug!(route = %path, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(route = %path, ?status, "Backend exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(route = %path, error = %e, "Error waiting for backend exit");
        }
        Err(_) => {
            warn!(
                route = %path,
                grace_secs = grace.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Stream child stdout/stderr into the log so pipes never fill up
fn drain_output(path: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let route = path.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(route = %route, "backend: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let route = path.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(route = %route, "backend stderr: {}", line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(routes_toml: &str) -> Config {
        Config::from_toml(&format!(
            r#"
            [defaults]
            base_port = 23100
            startup_timeout_secs = 1
            probe_interval_ms = 20
            shutdown_grace_period_secs = 1
            shutdown_deadline_secs = 5
            max_retries = 2
            backoff_base_ms = 10
            backoff_cap_ms = 40

            {}
            "#,
            routes_toml
        ))
        .unwrap()
    }

    fn manager_for(routes_toml: &str) -> (Arc<ProcessManager>, watch::Sender<bool>) {
        let config = test_config(routes_toml);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (ProcessManager::new(&config, None, shutdown_rx), shutdown_tx)
    }

    async fn wait_for_state(
        manager: &ProcessManager,
        path: &str,
        state: ProcessState,
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if manager.state(path) == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_initial_state_is_pending() {
        let (manager, _tx) = manager_for(r#"[routes]
            "/cli" = "sleep 60""#);
        assert_eq!(manager.state("/cli"), ProcessState::Pending);
        assert!(!manager.is_running("/cli"));
        assert!(manager.port("/cli").is_some());
    }

    #[tokio::test]
    async fn test_spawn_unknown_route() {
        let (manager, _tx) = manager_for(r#"[routes]
            "/cli" = "sleep 60""#);
        let err = manager.spawn("/nope").await.unwrap_err();
        assert!(err.to_string().contains("unknown route"));
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let (manager, _tx) = manager_for(r#"[routes]
            "/cli" = "sleep 60""#);

        manager.spawn("/cli").await.unwrap();
        assert_eq!(manager.state("/cli"), ProcessState::Starting);
        assert!(manager.subscribe_ready("/cli").is_some());

        manager.stop("/cli").await;
        assert_eq!(manager.state("/cli"), ProcessState::Stopped);

        // Idempotent
        manager.stop("/cli").await;
        assert_eq!(manager.state("/cli"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_concurrent_with_spawn() {
        // Whichever side wins the interleaving, the route must end up
        // Stopped with no child left behind.
        for _ in 0..5 {
            let (manager, _tx) = manager_for(r#"[routes]
                "/cli" = "sleep 60""#);

            let spawner = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let _ = manager.spawn("/cli").await;
                })
            };
            manager.stop("/cli").await;
            spawner.await.unwrap();

            assert_eq!(manager.state("/cli"), ProcessState::Stopped);

            let start = Instant::now();
            loop {
                if manager.statuses(|_| 0)[0].pid.is_none() {
                    break;
                }
                assert!(
                    start.elapsed() < Duration::from_secs(5),
                    "child outlived the stop"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_idempotent_while_starting() {
        let (manager, _tx) = manager_for(r#"[routes]
            "/cli" = "sleep 60""#);

        manager.spawn("/cli").await.unwrap();
        manager.spawn("/cli").await.unwrap();
        assert_eq!(manager.state("/cli"), ProcessState::Starting);
        manager.stop("/cli").await;
    }

    #[tokio::test]
    async fn test_crash_loop_reaches_terminal_failed() {
        let (manager, _tx) = manager_for(
            r#"[routes."/crash"]
            command = "false"
            max_retries = 2"#,
        );

        manager.spawn("/crash").await.unwrap();

        // 1 initial start + 2 retries, all exiting immediately, with tiny
        // backoffs: terminal Failed well within the window
        assert!(
            wait_for_state(&manager, "/crash", ProcessState::Failed, Duration::from_secs(10))
                .await
        );

        // Terminal: spawn refuses to retry
        assert!(manager.spawn("/crash").await.is_err());
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_crash() {
        let (manager, _tx) = manager_for(
            r#"[routes."/once"]
            command = "false"
            max_retries = 0"#,
        );

        manager.spawn("/once").await.unwrap();
        assert!(
            wait_for_state(&manager, "/once", ProcessState::Failed, Duration::from_secs(5)).await
        );
    }

    #[tokio::test]
    async fn test_spawn_error_consumes_retry_budget() {
        let (manager, _tx) = manager_for(
            r#"[routes."/missing"]
            command = "/nonexistent/definitely-not-a-command"
            max_retries = 0"#,
        );

        let err = manager.spawn("/missing").await.unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert_eq!(manager.state("/missing"), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_stop_all_terminates_every_backend() {
        let (manager, _tx) = manager_for(
            r#"[routes]
            "/a" = "sleep 60"
            "/b" = "sleep 60""#,
        );

        manager.spawn("/a").await.unwrap();
        manager.spawn("/b").await.unwrap();

        manager.stop_all().await;
        assert_eq!(manager.state("/a"), ProcessState::Stopped);
        assert_eq!(manager.state("/b"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (manager, _tx) = manager_for(r#"[routes]
            "/cli" = "sleep 60""#);

        manager.spawn("/cli").await.unwrap();
        manager.stop("/cli").await;
        assert_eq!(manager.state("/cli"), ProcessState::Stopped);

        manager.restart("/cli").await.unwrap();
        assert_eq!(manager.state("/cli"), ProcessState::Starting);
        assert!(manager.port("/cli").is_some());
        manager.stop("/cli").await;
    }

    #[tokio::test]
    async fn test_statuses_snapshot() {
        let (manager, _tx) = manager_for(
            r#"[routes]
            "/a" = "sleep 60"
            "/b" = "sleep 60""#,
        );

        let statuses = manager.statuses(|_| 0);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].route, "/a");
        assert_eq!(statuses[1].route, "/b");
        assert!(statuses.iter().all(|s| s.state == ProcessState::Pending));

        let ports: Vec<_> = statuses.iter().filter_map(|s| s.port).collect();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let mut defaults = RouteDefaults::default();
        defaults.backoff_base_ms = 100;
        defaults.backoff_cap_ms = 450;

        assert_eq!(backoff_delay(&defaults, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&defaults, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&defaults, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&defaults, 4), Duration::from_millis(450));
        assert_eq!(backoff_delay(&defaults, 40), Duration::from_millis(450));
    }
}
