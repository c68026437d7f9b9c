//! The per-service lifecycle state machine.
//!
//! ```text
//! Stopped --start--> Starting --ready--> Running --stop--> Stopping --> Stopped
//! Starting --spawn or readiness failure--> Failed
//! Running --process exits on its own--> Failed
//! ```
//!
//! Every transition happens while holding the service's exclusivity lock, so two
//! lifecycle operations on the same name never overlap. Different names proceed
//! in parallel.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definition::ServiceDefinition;
use crate::error::SupervisorError;
use crate::logs::{LogSink, Stream};
use crate::metrics;
use crate::probe::{self, ReadinessCheck, ReadinessProbe, ATTEMPT_TIMEOUT};
use crate::process::{self, ExitInfo, LiveProcess};
use crate::registry::{RuntimeState, ServiceEntry, ServiceGuard, ServiceRegistry, ServiceStatus};

/// How long to wait for a process to disappear after a forced kill.
pub const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 256;

/// Published on every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// Outcome of a batch operation, one entry per service in registration order.
pub type BatchResult = Vec<(String, Result<RuntimeState, SupervisorError>)>;

pub struct Supervisor {
    registry: ServiceRegistry,
    logs: Arc<LogSink>,
    base_directory: PathBuf,
    events: broadcast::Sender<StatusEvent>,
    shutdown: CancellationToken,
    run_ids: AtomicU64,
}

impl Supervisor {
    /// `base_directory` is what relative working directories resolve against.
    pub fn new(logs: Arc<LogSink>, base_directory: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: ServiceRegistry::new(),
            logs,
            base_directory: base_directory.into(),
            events,
            shutdown: CancellationToken::new(),
            run_ids: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.logs
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Cancelling this token aborts every readiness wait in flight.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>, SupervisorError> {
        self.registry
            .lookup(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_owned()))
    }

    pub fn state(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        Ok(self.entry(name)?.state())
    }

    /// Add a service in the Stopped state.
    pub fn register(&self, definition: ServiceDefinition) -> Result<(), SupervisorError> {
        let entry = self.registry.register(definition)?;
        debug!(service = %entry.name(), "service registered");
        Ok(())
    }

    /// Stop a service if needed, then forget it. Its log file stays on disk.
    pub async fn unregister(&self, name: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }

        self.stop_locked(&entry, &mut guard).await?;
        self.unregister_locked(&entry, &mut guard)
    }

    /// Drop a stopped entry from the registry. Operations queued on its lock see NotFound.
    pub(crate) fn unregister_locked(
        &self,
        entry: &Arc<ServiceEntry>,
        guard: &mut ServiceGuard<'_>,
    ) -> Result<(), SupervisorError> {
        let name = entry.name();
        self.registry.unregister(&name)?;
        guard.retire();
        self.logs.forget(&name);
        info!(service = %name, "service unregistered");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let result = self.start_inner(name).await;
        record("start", &result);
        result
    }

    pub async fn stop(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let result = self.stop_inner(name).await;
        record("stop", &result);
        result
    }

    /// Stop then start under one hold of the lock, so nothing can slip in between.
    pub async fn restart(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let result = self.restart_inner(name).await;
        record("restart", &result);
        result
    }

    pub async fn start_all(&self) -> BatchResult {
        let names = self.registry.names();
        let results = join_all(names.iter().map(|name| self.start(name))).await;
        names.into_iter().zip(results).collect()
    }

    pub async fn stop_all(&self) -> BatchResult {
        let names = self.registry.names();
        let results = join_all(names.iter().map(|name| self.stop(name))).await;
        names.into_iter().zip(results).collect()
    }

    pub async fn restart_all(&self) -> BatchResult {
        let names = self.registry.names();
        let results = join_all(names.iter().map(|name| self.restart(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Mark a stopped service as Running when something already answers on its port.
    /// Returns whether the service was adopted.
    pub async fn adopt(&self, name: &str) -> Result<bool, SupervisorError> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }
        Ok(self.adopt_locked(&entry, &mut guard).await)
    }

    /// Adopt every registered service whose port is already in use. Returns the adopted names.
    pub async fn adopt_running(&self) -> Vec<String> {
        let entries = self.registry.list_all();
        let adopted = join_all(entries.iter().map(|entry| async move {
            let mut guard = entry.lock().await;
            !guard.is_retired() && self.adopt_locked(entry, &mut guard).await
        }))
        .await;

        entries
            .iter()
            .zip(adopted)
            .filter(|(_, adopted)| *adopted)
            .map(|(entry, _)| entry.name())
            .collect()
    }

    /// Cancel in-flight readiness waits and optionally stop everything.
    pub async fn shutdown(&self, stop_services: bool) {
        self.shutdown.cancel();
        if stop_services {
            for (name, result) in self.stop_all().await {
                if let Err(e) = result {
                    warn!(service = %name, "failed to stop during shutdown: {}", e);
                }
            }
        }
    }

    async fn start_inner(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }
        self.start_locked(&entry, &mut guard).await?;
        Ok(entry.state())
    }

    async fn stop_inner(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }
        self.stop_locked(&entry, &mut guard).await?;
        Ok(entry.state())
    }

    async fn restart_inner(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }
        self.stop_locked(&entry, &mut guard).await?;
        self.start_locked(&entry, &mut guard).await?;
        Ok(entry.state())
    }

    pub(crate) async fn start_locked(
        &self,
        entry: &Arc<ServiceEntry>,
        guard: &mut ServiceGuard<'_>,
    ) -> Result<(), SupervisorError> {
        let definition = entry.definition();
        let name = definition.name.clone();

        if guard.status() == ServiceStatus::Running {
            debug!(service = %name, "already running");
            return Ok(());
        }
        // A process that outlived a failed stop has to go before another one is spawned.
        if guard.has_survivor() || guard.is_adopted() {
            self.stop_locked(entry, guard).await?;
        }

        self.transition(&name, guard, |state| {
            state.status = ServiceStatus::Starting;
            state.pid = None;
            state.started_at = None;
            state.last_error = None;
        });

        if let Err(e) = self.logs.reset(&name).await {
            warn!(service = %name, "failed to reset log: {}", e);
        }
        let (program, args) = process::command_line(&definition);
        let marker = format!("starting: {} {}", program, args.join(" "));
        self.logs.write(&name, Stream::Stdout, marker.trim_end());

        let started = Instant::now();
        let result = self.spawn_until_ready(entry, guard, &definition).await;
        metrics::emit_start_duration(&name, result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(pid) => {
                self.transition(&name, guard, |state| {
                    state.status = ServiceStatus::Running;
                    state.pid = Some(pid);
                    state.started_at = Some(Utc::now());
                    state.last_error = None;
                });
                info!(service = %name, pid, "service is ready");
                Ok(())
            }
            Err(error) => {
                if let Some(live) = guard.detach() {
                    live.kill();
                    if live.wait_exit(FORCE_KILL_WAIT).await.is_none() {
                        warn!(service = %name, pid = live.pid, "process survived a forced kill");
                    }
                }
                self.logs
                    .write(&name, Stream::Stderr, &format!("start failed: {}", error));
                self.transition(&name, guard, |state| {
                    state.status = ServiceStatus::Failed;
                    state.pid = None;
                    state.started_at = None;
                    state.last_error = Some(error.to_string());
                });
                warn!(service = %name, "failed to start: {}", error);
                Err(error)
            }
        }
    }

    /// Spawn the process, retain its handle in the guard and wait for readiness.
    async fn spawn_until_ready(
        &self,
        entry: &Arc<ServiceEntry>,
        guard: &mut ServiceGuard<'_>,
        definition: &ServiceDefinition,
    ) -> Result<u32, SupervisorError> {
        let check = ReadinessCheck::for_definition(definition)?;

        let spawn_failure = |source: io::Error| SupervisorError::SpawnFailure {
            command: definition.command.clone(),
            source,
        };
        let mut child = process::build_command(definition, &self.base_directory)
            .spawn()
            .map_err(spawn_failure)?;
        let pid = child.id().ok_or_else(|| {
            spawn_failure(io::Error::new(
                io::ErrorKind::Other,
                "process exited before its pid was known",
            ))
        })?;

        let (line_tx, mut lines) = mpsc::unbounded_channel();
        let line_tx = check.needs_output().then_some(line_tx);
        self.capture(&definition.name, child.stdout.take(), Stream::Stdout, line_tx.clone());
        self.capture(&definition.name, child.stderr.take(), Stream::Stderr, line_tx);

        let run_id = self.run_ids.fetch_add(1, Ordering::Relaxed);
        let live = LiveProcess::watch(run_id, pid, child);
        let mut exit = live.exit_receiver();
        self.observe_exit(entry.clone(), run_id, live.exit_receiver());
        guard.attach(live);
        debug!(service = %definition.name, pid, run_id, "process spawned");

        let probe = ReadinessProbe::new(check, definition.startup_timeout());
        let cancel = self.shutdown.child_token();
        tokio::select! {
            biased;

            ready = probe.wait(&mut lines, &cancel) => ready.map(|_| pid).map_err(SupervisorError::from),
            info = process::wait_for_exit(&mut exit) => Err(SupervisorError::UnexpectedExit(
                format!("{} during startup", info),
            )),
        }
    }

    /// Forward one output stream, line by line, to the log sink and, in pattern
    /// mode, to the readiness probe.
    fn capture<R>(
        &self,
        name: &str,
        reader: Option<R>,
        stream: Stream,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(reader) = reader else {
            return;
        };
        let logs = self.logs.clone();
        let name = name.to_owned();

        tokio::spawn(async move {
            let mut lines = lines;
            let mut segments = BufReader::new(reader).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(raw)) => {
                        let line = String::from_utf8_lossy(&raw)
                            .trim_end_matches('\r')
                            .to_owned();
                        logs.write(&name, stream, &line);

                        let closed = lines.as_ref().is_some_and(|tx| tx.send(line).is_err());
                        if closed {
                            lines = None;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(service = %name, "output stream closed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// Mark the service Failed when its process exits while it is Running.
    /// A stop, a failed start or a newer run all clear or replace the handle first,
    /// so the run id check makes this a no-op for them.
    fn observe_exit(
        &self,
        entry: Arc<ServiceEntry>,
        run_id: u64,
        mut exit: watch::Receiver<Option<ExitInfo>>,
    ) {
        let events = self.events.clone();
        let logs = self.logs.clone();

        tokio::spawn(async move {
            let info = process::wait_for_exit(&mut exit).await;
            let mut guard = entry.lock().await;

            let current = guard.live().map(|live| live.run_id);
            if current != Some(run_id) || guard.status() != ServiceStatus::Running {
                return;
            }

            let name = entry.name();
            let error = SupervisorError::UnexpectedExit(info.to_string());
            guard.detach();
            let state = guard.update(|state| {
                state.status = ServiceStatus::Failed;
                state.pid = None;
                state.started_at = None;
                state.last_error = Some(error.to_string());
            });
            publish(&events, &name, &state);
            drop(guard);

            logs.write(&name, Stream::Stderr, &error.to_string());
            warn!(service = %name, "{}", error);
            metrics::emit_unexpected_exit(&name);
        });
    }

    pub(crate) async fn stop_locked(
        &self,
        entry: &Arc<ServiceEntry>,
        guard: &mut ServiceGuard<'_>,
    ) -> Result<(), SupervisorError> {
        if guard.status() == ServiceStatus::Stopped {
            return Ok(());
        }

        let definition = entry.definition();
        let name = definition.name.clone();
        self.transition(&name, guard, |state| state.status = ServiceStatus::Stopping);

        // Only an adopted process is looked up by port; a service that failed or
        // crashed has nothing left to stop, whoever holds the port now.
        let outcome = match guard.live() {
            Some(live) => terminate_handle(&name, live, definition.shutdown_timeout()).await,
            None if guard.is_adopted() => terminate_by_port(&name, &definition).await,
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                guard.detach();
                self.logs.write(&name, Stream::Stdout, "stopped");
                self.transition(&name, guard, |state| {
                    state.status = ServiceStatus::Stopped;
                    state.pid = None;
                    state.started_at = None;
                    state.last_error = None;
                });
                info!(service = %name, "service stopped");
                Ok(())
            }
            Err(reason) => {
                let error = SupervisorError::StopFailure {
                    name: name.clone(),
                    reason,
                };
                self.transition(&name, guard, |state| {
                    state.status = ServiceStatus::Failed;
                    state.started_at = None;
                    state.last_error = Some(error.to_string());
                });
                warn!(service = %name, "{}", error);
                Err(error)
            }
        }
    }

    async fn adopt_locked(&self, entry: &Arc<ServiceEntry>, guard: &mut ServiceGuard<'_>) -> bool {
        if guard.live().is_some() || guard.status().is_live() {
            return false;
        }

        let definition = entry.definition();
        let Some(port) = definition.port else {
            return false;
        };
        if !probe::port_reachable(port, ATTEMPT_TIMEOUT).await {
            return false;
        }

        let pid = tokio::task::spawn_blocking(move || process::find_port_owner(port))
            .await
            .ok()
            .flatten();

        let name = definition.name.clone();
        guard.adopt();
        self.logs.write(
            &name,
            Stream::Stdout,
            &format!("adopted process already listening on port {}", port),
        );
        self.transition(&name, guard, |state| {
            state.status = ServiceStatus::Running;
            state.pid = pid;
            state.started_at = Some(Utc::now());
            state.last_error = None;
        });
        info!(service = %name, port, pid, "adopted running service");
        true
    }

    fn transition<F>(&self, name: &str, guard: &mut ServiceGuard<'_>, f: F) -> RuntimeState
    where
        F: FnOnce(&mut RuntimeState),
    {
        let state = guard.update(f);
        publish(&self.events, name, &state);
        state
    }
}

fn publish(events: &broadcast::Sender<StatusEvent>, name: &str, state: &RuntimeState) {
    // Sending only fails when nobody is subscribed.
    drop(events.send(StatusEvent {
        name: name.to_owned(),
        status: state.status,
        pid: state.pid,
        error: state.last_error.clone(),
    }));
}

fn record<T>(operation: &str, result: &Result<T, SupervisorError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::emit_operation(operation, label);
}

/// Graceful signal to the process group, then a forced kill once `timeout` passes.
async fn terminate_handle(name: &str, live: &LiveProcess, timeout: Duration) -> Result<(), String> {
    if live.has_exited() {
        return Ok(());
    }

    match live.terminate() {
        Ok(()) => {
            if let Some(info) = live.wait_exit(timeout).await {
                debug!(service = %name, pid = live.pid, "exited after graceful termination ({})", info);
                return Ok(());
            }
            warn!(
                service = %name,
                pid = live.pid,
                timeout_secs = timeout.as_secs_f64(),
                "graceful shutdown timed out, killing process tree"
            );
        }
        Err(e) => debug!(service = %name, "graceful termination unavailable: {}", e),
    }

    live.kill();
    match live.wait_exit(FORCE_KILL_WAIT).await {
        Some(_) => Ok(()),
        None => Err(format!("process {} survived a forced kill", live.pid)),
    }
}

/// Stop whatever owns the service's port when no handle was retained,
/// e.g. for a process adopted from an earlier session.
async fn terminate_by_port(name: &str, definition: &ServiceDefinition) -> Result<(), String> {
    let Some(port) = definition.port else {
        debug!(service = %name, "no retained process and no port, nothing to stop");
        return Ok(());
    };
    if !probe::port_reachable(port, ATTEMPT_TIMEOUT).await {
        return Ok(());
    }

    let owner = tokio::task::spawn_blocking(move || process::find_port_owner(port))
        .await
        .ok()
        .flatten();
    let Some(pid) = owner else {
        return Err(format!(
            "port {} is in use but its owning process could not be found",
            port
        ));
    };
    info!(service = %name, pid, port, "stopping the process that owns the service port");

    for force in [false, true] {
        let signalled = tokio::task::spawn_blocking(move || process::signal_tree(pid, force))
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

        if let Err(e) = signalled {
            if !probe::port_reachable(port, ATTEMPT_TIMEOUT).await {
                return Ok(());
            }
            if force {
                return Err(format!("failed to kill process {}: {}", pid, e));
            }
            debug!(service = %name, pid, "graceful signal failed: {}", e);
            continue;
        }

        let wait = if force {
            FORCE_KILL_WAIT
        } else {
            definition.shutdown_timeout()
        };
        if wait_port_closed(port, wait).await {
            return Ok(());
        }
        if !force {
            warn!(service = %name, pid, "graceful shutdown timed out, killing process tree");
        }
    }

    Err(format!(
        "port {} is still in use after killing process {}",
        port, pid
    ))
}

async fn wait_port_closed(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !probe::port_reachable(port, ATTEMPT_TIMEOUT).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::new(Arc::new(LogSink::new(dir.join("logs"))), dir)
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        assert!(matches!(
            supervisor.start("ghost").await,
            Err(SupervisorError::NotFound(name)) if name == "ghost"
        ));
        assert!(matches!(
            supervisor.stop("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            supervisor.unregister("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_of_stopped_service_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("idle", "does-not-matter"))
            .unwrap();
        let mut events = supervisor.subscribe();

        let state = supervisor.stop("idle").await.unwrap();

        assert_eq!(state.status, ServiceStatus::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new(
                "broken",
                "/definitely/not/a/real/binary",
            ))
            .unwrap();

        let result = supervisor.start("broken").await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailure { .. })));

        let state = supervisor.state("broken").unwrap();
        assert_eq!(state.status, ServiceStatus::Failed);
        assert!(state.pid.is_none());
        assert!(state
            .last_error
            .unwrap()
            .contains("/definitely/not/a/real/binary"));
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("bad", "/definitely/not/a/real/binary").with_ready_pattern("("))
            .unwrap();

        assert!(matches!(
            supervisor.start("bad").await,
            Err(SupervisorError::Validation(_))
        ));
        assert_eq!(
            supervisor.state("bad").unwrap().status,
            ServiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("broken", "/definitely/not/a/real/binary"))
            .unwrap();
        let mut events = supervisor.subscribe();

        assert!(supervisor.start("broken").await.is_err());

        let starting = events.try_recv().unwrap();
        assert_eq!(starting.name, "broken");
        assert_eq!(starting.status, ServiceStatus::Starting);
        let failed = events.try_recv().unwrap();
        assert_eq!(failed.status, ServiceStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_failed_service_stops_without_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("broken", "/definitely/not/a/real/binary"))
            .unwrap();
        assert!(supervisor.start("broken").await.is_err());

        let state = supervisor.stop("broken").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_adopt_requires_an_open_port() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("portless", "x"))
            .unwrap();

        assert!(!supervisor.adopt("portless").await.unwrap());
        assert!(supervisor.adopt_running().await.is_empty());
    }

    #[tokio::test]
    async fn test_adopt_marks_running_when_port_is_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        supervisor
            .register(ServiceDefinition::new("web", "x").with_port(port))
            .unwrap();

        assert_eq!(supervisor.adopt_running().await, vec!["web".to_owned()]);

        let state = supervisor.state("web").unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert!(state.started_at.is_some());

        // Start on an adopted service is a no-op rather than a second spawn.
        let state = supervisor.start("web").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        drop(listener);
    }

    #[tokio::test]
    async fn test_stop_leaves_a_port_taken_over_after_a_failure_alone() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        supervisor
            .register(ServiceDefinition::new("web", "/definitely/not/a/real/binary").with_port(port))
            .unwrap();
        assert!(supervisor.start("web").await.is_err());

        // Someone else binds the port once the service has failed.
        let bystander = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();

        let state = supervisor.stop("web").await.unwrap();

        assert_eq!(state.status, ServiceStatus::Stopped);
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let (accepted, connected) = tokio::join!(bystander.accept(), connect);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stops_a_process_that_outlived_a_failed_stop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(ServiceDefinition::new("svc", "/bin/sh").with_args(["-c", "sleep 30"]))
            .unwrap();
        let first = supervisor.start("svc").await.unwrap().pid.unwrap();

        // The state a stop leaves when its forced kill goes unanswered.
        let entry = supervisor.entry("svc").unwrap();
        let mut guard = entry.lock().await;
        guard.update(|state| {
            state.status = ServiceStatus::Failed;
            state.last_error = Some("process survived a forced kill".to_owned());
        });
        let old_exit = guard.live().unwrap().exit_receiver();
        drop(guard);

        let second = supervisor.start("svc").await.unwrap().pid.unwrap();

        assert_ne!(first, second);
        assert!(old_exit.borrow().is_some());
        assert_eq!(supervisor.state("svc").unwrap().status, ServiceStatus::Running);
        supervisor.stop("svc").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_event_precedes_the_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .register(
                ServiceDefinition::new("flaky", "/bin/sh").with_args(["-c", "sleep 0.2; exit 1"]),
            )
            .unwrap();
        let mut events = supervisor.subscribe();

        supervisor.start("flaky").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.state("flaky").unwrap().status != ServiceStatus::Failed {
            assert!(Instant::now() < deadline, "service never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        supervisor.start("flaky").await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(
            statuses[..4],
            [
                ServiceStatus::Starting,
                ServiceStatus::Running,
                ServiceStatus::Failed,
                ServiceStatus::Starting,
            ]
        );
        supervisor.stop("flaky").await.unwrap();
    }
}
