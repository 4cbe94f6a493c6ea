//! Service manager: start, supervise and stop long-running service tools.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`, with
//! `Failed` reachable from `Starting`, `Running` and `Stopping`. Transitions
//! for one tool are serialized by a per-tool async lock.
//!
//! A running service is owned by a supervisor task holding the child process
//! and its concurrency permit. The permit is released when the supervisor
//! ends, whether the service was stopped or died on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::context::CallContext;
use super::executor::{
    finish_readers, pump, terminate, Capture, CommandExecutor, CommandOutput, CommandSpec,
    SharedCapture, StreamKind,
};
use super::governor::{ConcurrencyGovernor, Permit};
use super::status::StatusWriter;
use crate::tools::{ConcurrencyGroup, ServiceTool, ToolStatus};
use crate::types::{Error, Result, ToolId};

/// How much of a dead service's stderr is kept in its error string.
const ERROR_TAIL_CHARS: usize = 512;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceState {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        match (self, to) {
            // STOPPED / FAILED
            (ServiceState::Stopped, ServiceState::Starting) => true,
            (ServiceState::Failed, ServiceState::Starting) => true,
            (ServiceState::Failed, ServiceState::Stopped) => true,
            // STARTING
            (ServiceState::Starting, ServiceState::Running) => true,
            (ServiceState::Starting, ServiceState::Failed) => true,
            (ServiceState::Starting, ServiceState::Stopped) => true, // gave up while queued
            // RUNNING
            (ServiceState::Running, ServiceState::Stopping) => true,
            (ServiceState::Running, ServiceState::Failed) => true,
            // STOPPING
            (ServiceState::Stopping, ServiceState::Stopped) => true,
            (ServiceState::Stopping, ServiceState::Failed) => true,
            _ => false,
        }
    }

    pub fn as_status(self) -> ToolStatus {
        match self {
            ServiceState::Stopped => ToolStatus::Stopped,
            ServiceState::Starting => ToolStatus::Starting,
            ServiceState::Running => ToolStatus::Running,
            ServiceState::Stopping => ToolStatus::Stopping,
            ServiceState::Failed => ToolStatus::Failed,
        }
    }
}

/// Observable state of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub state: ServiceState,
    /// Non-empty only in `Failed`.
    pub error: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            state: ServiceState::Stopped,
            error: String::new(),
            pid: None,
            started_at: None,
        }
    }
}

struct Supervised {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Supervised {
    /// Ask the supervisor to terminate the service and wait for it to finish.
    async fn shut_down(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "service supervisor ended abnormally");
        }
    }
}

#[derive(Default)]
struct Slot {
    /// Tool name, for logs once the record is out of reach.
    name: String,
    info: ServiceInfo,
    supervised: Option<Supervised>,
}

#[derive(Default)]
struct ServiceHandle {
    transition: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl ServiceHandle {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self) -> ServiceInfo {
        self.slot().info.clone()
    }

    fn set_state(&self, to: ServiceState, error: String) -> Result<()> {
        let mut slot = self.slot();
        let from = slot.info.state;
        if !from.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "cannot move service from {:?} to {:?}",
                from, to
            )));
        }
        slot.info.state = to;
        slot.info.error = error;
        if !matches!(to, ServiceState::Running | ServiceState::Stopping) {
            slot.info.pid = None;
        }
        Ok(())
    }
}

fn exit_description(code: Option<i32>, stderr: &str) -> String {
    let code = match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    };
    let stderr = stderr.trim();
    let start = stderr
        .char_indices()
        .rev()
        .nth(ERROR_TAIL_CHARS.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    if stderr.is_empty() {
        format!("exited with {}", code)
    } else {
        format!("exited with {}: {}", code, &stderr[start..])
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Supervisor {
    id: ToolId,
    name: String,
    child: Child,
    _permit: Option<Permit>,
    stop_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    stderr: SharedCapture,
    handle: Arc<ServiceHandle>,
    status: Arc<StatusWriter>,
    stop_grace: Duration,
    drain_grace: Duration,
}

impl Supervisor {
    async fn run(mut self) {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            // A dropped sender also means stop.
            _ = &mut self.stop_rx => None,
        };

        match exited {
            None => {
                terminate(&mut self.child, self.stop_grace).await;
                finish_readers(self.readers, self.drain_grace).await;
                tracing::info!(service = %self.name, "service terminated");
            }
            Some(status) => {
                finish_readers(self.readers, self.drain_grace).await;
                let (stderr, _) = Capture::snapshot(&self.stderr);
                let code = status.ok().and_then(|s| s.code());
                let error = exit_description(code, &stderr);

                // A concurrent stop has already moved the state on.
                let failed = self.handle.set_state(ServiceState::Failed, error.clone()).is_ok();
                if failed {
                    tracing::warn!(service = %self.name, error = %error, "service exited unexpectedly");
                    if let Err(e) = self.status.write(self.id, ToolStatus::Failed, error).await {
                        tracing::warn!(service = %self.name, error = %e, "failed to record service failure");
                    }
                }
            }
        }
    }
}

enum Startup {
    Exited(std::io::Result<ExitStatus>),
    Survived,
    Cancelled(Error),
}

// =============================================================================
// Manager
// =============================================================================

pub struct ServiceManager {
    executor: CommandExecutor,
    governor: Arc<ConcurrencyGovernor>,
    status: Arc<StatusWriter>,
    handles: Mutex<HashMap<ToolId, Arc<ServiceHandle>>>,
}

impl ServiceManager {
    pub fn new(
        executor: CommandExecutor,
        governor: Arc<ConcurrencyGovernor>,
        status: Arc<StatusWriter>,
    ) -> Self {
        Self {
            executor,
            governor,
            status,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handle_for(&self, id: ToolId) -> Arc<ServiceHandle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    /// Current state; `Stopped` for services never started.
    pub fn info(&self, id: ToolId) -> ServiceInfo {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|h| h.info())
            .unwrap_or_default()
    }

    async fn publish(&self, id: ToolId, state: ServiceState, error: &str) {
        if let Err(e) = self.status.write(id, state.as_status(), error).await {
            tracing::warn!(tool_id = %id, state = ?state, error = %e, "failed to record service state");
        }
    }

    async fn settle(&self, handle: &ServiceHandle, id: ToolId, state: ServiceState, error: String) {
        match handle.set_state(state, error.clone()) {
            Ok(()) => self.publish(id, state, &error).await,
            Err(e) => tracing::warn!(tool_id = %id, error = %e, "unexpected service transition"),
        }
    }

    /// Start a service and hold a slot in its concurrency group until it stops.
    ///
    /// `Running` once the process survives the start grace window; a process
    /// that exits earlier fails with `ServiceExited` and leaves the service
    /// `Failed`.
    pub async fn start(
        &self,
        tool: &ServiceTool,
        group: Option<&ConcurrencyGroup>,
        ctx: &CallContext,
    ) -> Result<ServiceInfo> {
        let id = tool.meta.id;
        let name = tool.meta.name.as_str();
        let handle = self.handle_for(id);
        let _transition = ctx.run(handle.transition.lock()).await?;

        let current = handle.info().state;
        if !current.can_transition_to(ServiceState::Starting) {
            return Err(Error::state_transition(format!(
                "service '{}' is already {:?}",
                name, current
            )));
        }
        // Supervisor of a previous run that died on its own.
        let stale = handle.slot().supervised.take();
        if let Some(stale) = stale {
            stale.shut_down().await;
        }

        handle.set_state(ServiceState::Starting, String::new())?;
        handle.slot().name = name.to_string();
        self.publish(id, ServiceState::Starting, "").await;
        tracing::info!(service = %name, "starting service");

        let permit = match self.governor.acquire(group, ctx).await {
            Ok(permit) => permit,
            Err(e) => {
                self.settle(&handle, id, ServiceState::Stopped, String::new()).await;
                return Err(e);
            }
        };

        let config = self.executor.config();
        let spec = CommandSpec::shell(tool.start_cmd.clone(), Duration::MAX);
        let started = Instant::now();
        let mut child = match self.executor.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                self.settle(&handle, id, ServiceState::Failed, e.to_string()).await;
                return Err(e);
            }
        };
        let pid = child.id();

        let stdout = Capture::tail(config.tail_bytes);
        let stderr = Capture::tail(config.tail_bytes);
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                out,
                StreamKind::Stdout,
                stdout.clone(),
                None,
                config.chunk_bytes,
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                err,
                StreamKind::Stderr,
                stderr.clone(),
                None,
                config.chunk_bytes,
            )));
        }

        let startup = tokio::select! {
            status = child.wait() => Startup::Exited(status),
            _ = tokio::time::sleep(config.service_start_grace) => Startup::Survived,
            err = ctx.done() => Startup::Cancelled(err),
        };

        match startup {
            Startup::Exited(status) => {
                finish_readers(readers, config.kill_grace).await;
                let (out, out_trunc) = Capture::snapshot(&stdout);
                let (err, err_trunc) = Capture::snapshot(&stderr);
                let output = CommandOutput {
                    stdout: out,
                    stderr: err,
                    exit_code: status.ok().and_then(|s| s.code()),
                    elapsed: started.elapsed(),
                    truncated: out_trunc || err_trunc,
                };
                let error = format!(
                    "startup failed: {}",
                    exit_description(output.exit_code, &output.stderr)
                );
                drop(permit);
                tracing::warn!(service = %name, error = %error, "service failed to start");
                self.settle(&handle, id, ServiceState::Failed, error).await;
                Err(Error::ServiceExited {
                    tool: name.to_string(),
                    output: Box::new(output),
                })
            }
            Startup::Cancelled(err) => {
                terminate(&mut child, config.service_stop_grace).await;
                finish_readers(readers, config.kill_grace).await;
                drop(permit);
                self.settle(&handle, id, ServiceState::Stopped, String::new()).await;
                Err(err)
            }
            Startup::Survived => {
                {
                    let mut slot = handle.slot();
                    slot.info = ServiceInfo {
                        state: ServiceState::Running,
                        error: String::new(),
                        pid,
                        started_at: Some(Utc::now()),
                    };
                }
                // Published before the supervisor exists so a later failure
                // record cannot be overwritten by this one.
                self.publish(id, ServiceState::Running, "").await;

                let (stop_tx, stop_rx) = oneshot::channel();
                let supervisor = Supervisor {
                    id,
                    name: name.to_string(),
                    child,
                    _permit: permit,
                    stop_rx,
                    readers,
                    stderr,
                    handle: handle.clone(),
                    status: self.status.clone(),
                    stop_grace: config.service_stop_grace,
                    drain_grace: config.kill_grace,
                };
                let task = tokio::spawn(supervisor.run());
                handle.slot().supervised = Some(Supervised {
                    stop_tx: Some(stop_tx),
                    task,
                });
                tracing::info!(service = %name, pid = ?pid, "service running");
                Ok(handle.info())
            }
        }
    }

    /// Stop a service. No-op when already stopped; clears a failure.
    pub async fn stop(&self, tool: &ServiceTool, ctx: &CallContext) -> Result<ServiceInfo> {
        let handle = self.handle_for(tool.meta.id);
        let _transition = ctx.run(handle.transition.lock()).await?;
        self.stop_locked(tool.meta.id, &handle).await
    }

    async fn stop_locked(&self, id: ToolId, handle: &Arc<ServiceHandle>) -> Result<ServiceInfo> {
        let (name, state, supervised) = {
            let mut slot = handle.slot();
            let name = slot.name.clone();
            let state = slot.info.state;
            let supervised = match state {
                ServiceState::Running | ServiceState::Failed => slot.supervised.take(),
                _ => None,
            };
            (name, state, supervised)
        };

        match state {
            ServiceState::Stopped => {
                tracing::debug!(service = %name, "stop on stopped service");
            }
            ServiceState::Failed => {
                if let Some(supervised) = supervised {
                    supervised.shut_down().await;
                }
                self.settle(handle, id, ServiceState::Stopped, String::new()).await;
            }
            ServiceState::Running => {
                // Fails only if the supervisor just recorded a crash.
                let stopping = handle.set_state(ServiceState::Stopping, String::new()).is_ok();
                if stopping {
                    self.publish(id, ServiceState::Stopping, "").await;
                }
                tracing::info!(service = %name, "stopping service");
                if let Some(supervised) = supervised {
                    supervised.shut_down().await;
                }
                // From `Failed` too, which clears a crash recorded meanwhile.
                self.settle(handle, id, ServiceState::Stopped, String::new()).await;
            }
            ServiceState::Starting | ServiceState::Stopping => {
                return Err(Error::state_transition(format!(
                    "service '{}' is {:?}",
                    name, state
                )));
            }
        }
        Ok(handle.info())
    }

    /// Stop every running or failed service.
    pub async fn shutdown(&self) {
        let handles: Vec<(ToolId, Arc<ServiceHandle>)> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        for (id, handle) in handles {
            let _transition = handle.transition.lock().await;
            if let Err(e) = self.stop_locked(id, &handle).await {
                tracing::warn!(tool_id = %id, error = %e, "service did not stop cleanly");
            }
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ServiceManager")
            .field("tracked", &tracked)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
