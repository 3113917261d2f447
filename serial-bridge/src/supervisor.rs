//! The bridge supervisor facade.

use nix::sys::signal::Signal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::BridgeCommand;
use crate::config::{BridgeConfig, SupervisorSettings};
use crate::device::validate_device;
use crate::error::{BridgeError, BridgeResult};
use crate::events::LifecycleEvent;
use crate::output::OutputMonitor;
use crate::ports;
use crate::process::{self, ExitOutcome};
use crate::profile::Profile;
use crate::reconciler::{self, ExitNotice};
use crate::record::{BridgeId, BridgeStatus, ProcessRecord};
use crate::registry::{ProcessRegistry, StopTicket};
use crate::sink::LogSink;

/// Interval between readiness probes in [`BridgeSupervisor::wait_listening`].
const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed on top of the kill timeout for a teardown to publish.
const TEARDOWN_SLACK: Duration = Duration::from_secs(1);

/// State shared between the facade and the exit reconciler.
pub(crate) struct Shared {
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) sink: Arc<dyn LogSink>,
    events: broadcast::Sender<LifecycleEvent>,
    settings: SupervisorSettings,
}

impl Shared {
    /// Publish the current state of `record` to the sink and subscribers.
    pub(crate) fn emit(&self, record: &ProcessRecord) {
        let event = LifecycleEvent::from_record(record);
        self.sink.lifecycle(event.severity(), &event);
        // Having no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Starts, stops and tracks socat bridge processes.
///
/// All methods take `&self` and may be called concurrently; share the
/// supervisor behind an `Arc`. Dropping it SIGKILLs every bridge still
/// active in its registry.
pub struct BridgeSupervisor {
    shared: Arc<Shared>,
    exit_tx: mpsc::Sender<ExitNotice>,
    reconciler: JoinHandle<()>,
}

impl BridgeSupervisor {
    /// Create a supervisor with a fresh registry.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(settings: SupervisorSettings, sink: Arc<dyn LogSink>) -> Self {
        Self::with_registry(settings, sink, Arc::new(ProcessRegistry::new()))
    }

    /// Create a supervisor around an existing registry.
    pub fn with_registry(
        settings: SupervisorSettings,
        sink: Arc<dyn LogSink>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (exit_tx, exit_rx) = mpsc::channel(settings.exit_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            registry,
            sink,
            events,
            settings,
        });
        let reconciler = reconciler::spawn_worker(shared.clone(), exit_rx);
        Self {
            shared,
            exit_tx,
            reconciler,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.shared.registry
    }

    /// Start a bridge forwarding `device` to the TCP listener in `config`.
    ///
    /// The returned record is `Running`. Fails with
    /// - `DeviceNotFound` before anything is reserved or spawned,
    /// - `PortInUse` if an active bridge (or, with `probe_os_port`, any
    ///   listener on this host) holds the port,
    /// - `SpawnFailed` if the executable cannot be started,
    /// - `Cancelled` if `ct` fires or a stop lands before the bridge runs.
    pub async fn start(
        &self,
        config: &BridgeConfig,
        device: &Path,
        ct: &CancellationToken,
    ) -> BridgeResult<ProcessRecord> {
        self.launch(config, device, None, ct).await
    }

    /// Start a bridge from a saved profile.
    pub async fn start_profile(
        &self,
        profile: &Profile,
        device: &Path,
        ct: &CancellationToken,
    ) -> BridgeResult<ProcessRecord> {
        self.launch(&profile.configuration, device, Some(profile.name.clone()), ct)
            .await
    }

    async fn launch(
        &self,
        config: &BridgeConfig,
        device: &Path,
        profile: Option<String>,
        ct: &CancellationToken,
    ) -> BridgeResult<ProcessRecord> {
        validate_device(device)?;
        if ct.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let host = config.tcp_host.trim();
        let port = config.tcp_port;
        if self.shared.settings.probe_os_port && !self.is_port_in_use(host, port) {
            self.probe_port(host, port).await?;
        }

        let registry = &self.shared.registry;
        let command = BridgeCommand::new(&self.shared.settings.executable, config, device);
        let record =
            ProcessRecord::reserved(registry.next_id(), host, port, device, command.render())
                .with_profile(profile);
        let id = record.id;

        registry.reserve(record.clone())?;
        self.shared.emit(&record);

        if ct.is_cancelled() {
            self.rollback(id, BridgeStatus::Stopped);
            return Err(BridgeError::Cancelled);
        }

        let mut child = match command.to_tokio().spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!("Failed to spawn bridge {}: {}", id, source);
                self.rollback(id, BridgeStatus::Failed);
                return Err(BridgeError::SpawnFailed {
                    program: command.program().display().to_string(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            self.rollback(id, BridgeStatus::Failed);
            return Err(BridgeError::SpawnFailed {
                program: command.program().display().to_string(),
                source: std::io::Error::other("process exited before its PID was known"),
            });
        };

        let monitor = OutputMonitor::attach(
            id,
            child.stdout.take(),
            child.stderr.take(),
            self.shared.sink.clone(),
        );

        if ct.is_cancelled() {
            debug!("Start of bridge {} cancelled after spawn", id);
            self.abort_spawned(id, pid, child, monitor).await;
            return Err(BridgeError::Cancelled);
        }

        let (exited_tx, exited_rx) = watch::channel(None);
        match registry.mark_running(id, pid, exited_rx, monitor) {
            Ok(record) => {
                // Running is published before the watcher can report an exit
                self.shared.emit(&record);
                reconciler::spawn_exit_watcher(id, child, exited_tx, self.exit_tx.clone());
                info!(
                    "Started bridge {} on {} (PID {})",
                    id,
                    record.endpoint(),
                    pid
                );
                Ok(record)
            }
            Err(monitor) => {
                debug!("Bridge {} was stopped while starting", id);
                self.abort_spawned(id, pid, child, monitor).await;
                Err(BridgeError::Cancelled)
            }
        }
    }

    /// Fail if some other program on this host listens on `host:port`.
    async fn probe_port(&self, host: &str, port: u16) -> BridgeResult<()> {
        let target = host.to_string();
        match tokio::task::spawn_blocking(move || ports::listener_on(&target, port)).await {
            Ok(Some(listener)) => Err(BridgeError::port_in_use(host, port, listener.describe())),
            Ok(None) => Ok(()),
            Err(e) => {
                debug!("Port probe for {}:{} failed: {}", host, port, e);
                Ok(())
            }
        }
    }

    /// Drop a reservation that never got a running process.
    fn rollback(&self, id: BridgeId, status: BridgeStatus) {
        if let Some(retired) = self.shared.registry.retire(id, status, None) {
            self.shared.emit(&retired.record);
            retired.finalized.cancel();
        }
    }

    /// Tear down a child whose start was abandoned.
    async fn abort_spawned(&self, id: BridgeId, pid: u32, mut child: Child, monitor: OutputMonitor) {
        process::signal_group(pid, Signal::SIGKILL);
        let outcome =
            match tokio::time::timeout(self.shared.settings.kill_timeout(), child.wait()).await {
                Ok(Ok(status)) => ExitOutcome::from_status(status),
                Ok(Err(e)) => {
                    warn!("Failed to reap abandoned bridge {}: {}", id, e);
                    ExitOutcome::Unknown
                }
                Err(_) => {
                    warn!("Abandoned bridge {} (PID {}) did not exit after SIGKILL", id, pid);
                    ExitOutcome::Unknown
                }
            };
        monitor.shutdown().await;
        if let Some(retired) =
            self.shared
                .registry
                .retire(id, BridgeStatus::Stopped, outcome.exit_code())
        {
            self.shared.emit(&retired.record);
            retired.finalized.cancel();
        }
    }

    /// Stop a bridge: SIGTERM, up to `grace` to exit, then SIGKILL.
    ///
    /// Stopping an unknown or already finished bridge succeeds without doing
    /// anything. Cancelling `ct` skips the rest of the grace period.
    pub async fn stop(
        &self,
        id: BridgeId,
        grace: Duration,
        ct: &CancellationToken,
    ) -> BridgeResult<()> {
        match self.shared.registry.begin_stop(id) {
            StopTicket::Idle => {
                debug!("Bridge {} is not tracked, nothing to stop", id);
            }
            StopTicket::Settling { finalized } => {
                debug!("Bridge {} already ended, waiting for its teardown", id);
                self.await_finalized(id, &finalized).await;
            }
            StopTicket::Deferred {
                record,
                transitioned,
                finalized,
            } => {
                if transitioned {
                    self.shared.emit(&record);
                }
                debug!("Bridge {} is still starting, waiting for its start to tear it down", id);
                self.await_finalized(id, &finalized).await;
            }
            StopTicket::Terminate {
                record,
                transitioned,
                pid,
                exited,
                finalized,
            } => {
                if transitioned {
                    self.shared.emit(&record);
                    info!("Stopping bridge {} on {}", id, record.endpoint());
                }
                let outcome = match (pid, exited) {
                    (Some(pid), Some(exited)) => {
                        process::terminate(
                            pid,
                            exited,
                            grace,
                            self.shared.settings.kill_timeout(),
                            ct,
                        )
                        .await
                    }
                    _ => ExitOutcome::Unknown,
                };
                if reconciler::finalize(&self.shared, id, outcome).await.is_none() {
                    // The exit worker got there first
                    self.await_finalized(id, &finalized).await;
                }
            }
        }
        Ok(())
    }

    /// Wait until whoever settled `id` has removed it and published the event.
    ///
    /// Bounded by the kill timeout plus the output drain of the teardown.
    async fn await_finalized(&self, id: BridgeId, finalized: &CancellationToken) {
        let wait = self.shared.settings.kill_timeout() + TEARDOWN_SLACK;
        if tokio::time::timeout(wait, finalized.cancelled()).await.is_err() {
            warn!("Bridge {} was not torn down within {:?}", id, wait);
        }
    }

    /// Stop every active bridge concurrently.
    pub async fn stop_all(&self, grace: Duration) {
        let ct = CancellationToken::new();
        let ids: Vec<BridgeId> = self
            .list()
            .into_iter()
            .filter(|record| record.status.is_active())
            .map(|record| record.id)
            .collect();
        if ids.is_empty() {
            return;
        }

        info!("Stopping {} bridges", ids.len());
        let results = futures::future::join_all(ids.iter().map(|&id| self.stop(id, grace, &ct))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop bridge {}: {}", id, e);
            }
        }
    }

    /// Stop every bridge with the configured grace period.
    pub async fn shutdown(&self) {
        self.stop_all(self.shared.settings.grace_period()).await;
    }

    pub fn query(&self, id: BridgeId) -> Option<ProcessRecord> {
        self.shared.registry.get(id)
    }

    /// Snapshot of every tracked bridge, ordered by id.
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.shared.registry.snapshot()
    }

    pub fn is_port_in_use(&self, host: &str, port: u16) -> bool {
        self.shared.registry.is_port_in_use(host, port)
    }

    /// Lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the bridge process listens on its TCP port.
    ///
    /// Returns `Ok(false)` if `timeout` elapses or the bridge ends first,
    /// and `NotFound` if the bridge is not tracked at all.
    pub async fn wait_listening(&self, id: BridgeId, timeout: Duration) -> BridgeResult<bool> {
        if self.query(id).is_none() {
            return Err(BridgeError::NotFound(id));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let Some(record) = self.query(id) else {
                return Ok(false);
            };
            if record.status.is_terminal() {
                return Ok(false);
            }
            if let (BridgeStatus::Running, Some(pid)) = (record.status, record.pid) {
                let port = record.tcp_port;
                match tokio::task::spawn_blocking(move || ports::pid_listening(pid, port)).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => debug!("Listen probe for bridge {} failed: {}", id, e),
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
        }
    }
}

impl Drop for BridgeSupervisor {
    fn drop(&mut self) {
        self.reconciler.abort();
        for pid in self.shared.registry.active_pids() {
            process::signal_group(pid, Signal::SIGKILL);
        }
    }
}
