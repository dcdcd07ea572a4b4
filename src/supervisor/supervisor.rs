//! Lifecycle supervisor for one wrapped tool.
//!
//! Owns the single active child process and every state transition:
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Ready ──stop──▶ Stopping ──▶ Idle
//!                    │               │  └─refresh─▶ Restarting ──▶ Starting
//!                    └──all failed──▶ Failed        └─exit─▶ Idle
//! ```
//!
//! `start()` is single-flight: concurrent callers share one launch chain run
//! and its outcome. Stop, restart, and crash all reject pending requests
//! before the process is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::config::SupervisorConfig;
use super::environment::{self, EnvOverrides};
use super::errors::SupervisorError;
use super::lifecycle::ProcessHandle;
use super::observer::{DiagnosticSink, SupervisorEvent, TracingSink};
use super::strategy::{LaunchChain, LaunchOutcome};
use super::transport::StdioTransport;
use super::types::{ClientTier, ServerInfo};

// ─── State ───────────────────────────────────────────────────────────────────

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Ready,
    Restarting,
    Stopping,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Ready => "ready",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type StartFuture = Shared<BoxFuture<'static, Result<ClientTier, SupervisorError>>>;

struct Status {
    state: SupervisorState,
    tier: ClientTier,
    overrides: EnvOverrides,
    in_flight: Option<StartFuture>,
    transport: Option<Arc<StdioTransport>>,
    server: Option<ServerInfo>,
    generation: u64,
    last_error: Option<SupervisorError>,
}

impl Status {
    /// Change state, returning the event to emit once the lock is released.
    fn transition(&mut self, to: SupervisorState) -> Option<SupervisorEvent> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        tracing::debug!(from = %from, to = %to, "supervisor state change");
        Some(SupervisorEvent::StateChanged {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

struct ActiveProcess {
    generation: u64,
    tier: ClientTier,
    handle: ProcessHandle,
    transport: Arc<StdioTransport>,
    monitor: JoinHandle<()>,
}

struct Inner {
    config: SupervisorConfig,
    chain: LaunchChain,
    sink: Arc<dyn DiagnosticSink>,
    status: StdMutex<Status>,
    active: Mutex<Option<ActiveProcess>>,
    /// Serialises stop and restart against each other.
    lifecycle: Mutex<()>,
    launches: AtomicU64,
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Option<SupervisorEvent>) {
        if let Some(event) = event {
            self.sink.on_event(&event);
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns one wrapped-tool process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Supervisor with the standard launch chain and a tracing sink.
    pub fn from_config(config: SupervisorConfig) -> Self {
        let chain = LaunchChain::from_config(&config);
        Self::new(config, chain, Arc::new(TracingSink))
    }

    /// Supervisor with an explicit chain and sink.
    pub fn new(
        config: SupervisorConfig,
        chain: LaunchChain,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                chain,
                sink,
                status: StdMutex::new(Status {
                    state: SupervisorState::Idle,
                    tier: ClientTier::None,
                    overrides: EnvOverrides::new(),
                    in_flight: None,
                    transport: None,
                    server: None,
                    generation: 0,
                    last_error: None,
                }),
                active: Mutex::new(None),
                lifecycle: Mutex::new(()),
                launches: AtomicU64::new(0),
            }),
        }
    }

    /// Set the credential/config overrides used by the next start.
    pub fn set_overrides(&self, overrides: EnvOverrides) {
        self.inner.status().overrides = overrides;
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the child if it is not running. Single-flight.
    ///
    /// Returns the active tier. A `Failed` supervisor may be started again.
    pub async fn start(&self) -> Result<ClientTier, SupervisorError> {
        let start = match self.begin_start() {
            Ok(start) => start,
            Err(outcome) => return outcome,
        };
        start.await
    }

    /// Join or create the in-flight start. `Err` carries an immediate outcome.
    fn begin_start(&self) -> Result<StartFuture, Result<ClientTier, SupervisorError>> {
        let (future, event) = {
            let mut status = self.inner.status();
            match status.state {
                SupervisorState::Ready => return Err(Ok(status.tier)),
                SupervisorState::Stopping => {
                    return Err(Err(SupervisorError::Stopping {
                        reason: "stop in progress".into(),
                    }))
                }
                _ => {}
            }
            if let Some(existing) = &status.in_flight {
                return Ok(existing.clone());
            }

            let inner = self.inner.clone();
            let future = async move { run_start(inner).await }.boxed().shared();
            status.in_flight = Some(future.clone());
            let event = status.transition(SupervisorState::Starting);
            (future, event)
        };
        self.inner.emit(event);
        Ok(future)
    }

    /// Stop the child. Pending requests fail with `Stopping`; the process gets
    /// SIGTERM, then SIGKILL after the grace window. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.settle_in_flight().await;

        let stopping = {
            let mut status = self.inner.status();
            match status.state {
                SupervisorState::Idle => None,
                _ => Some(status.transition(SupervisorState::Stopping)),
            }
        };
        let Some(event) = stopping else {
            tracing::debug!("stop on idle supervisor: nothing to do");
            return;
        };
        self.inner.emit(event);

        shutdown_active(
            &self.inner,
            SupervisorError::Stopping {
                reason: "stop requested".into(),
            },
        )
        .await;

        let event = {
            let mut status = self.inner.status();
            status.tier = ClientTier::None;
            status.transport = None;
            status.server = None;
            status.transition(SupervisorState::Idle)
        };
        self.inner.emit(event);
        tracing::info!(tool = %self.inner.config.name, "supervisor stopped");
    }

    /// Tear down the current process and start a new one with updated
    /// credentials. `overrides` is layered over the existing overrides.
    ///
    /// Pending requests fail immediately; nobody waits across the restart.
    pub async fn restart_with_new_credentials(
        &self,
        overrides: EnvOverrides,
    ) -> Result<ClientTier, SupervisorError> {
        let start = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            self.settle_in_flight().await;

            let event = {
                let mut status = self.inner.status();
                status.overrides = status.overrides.merged_with(&overrides);
                status.transition(SupervisorState::Restarting)
            };
            self.inner.emit(event);
            tracing::info!(tool = %self.inner.config.name, "restarting for credential refresh");

            shutdown_active(
                &self.inner,
                SupervisorError::Stopping {
                    reason: "restarting for credential refresh".into(),
                },
            )
            .await;

            {
                let mut status = self.inner.status();
                status.tier = ClientTier::None;
                status.transport = None;
                status.server = None;
            }

            match self.begin_start() {
                Ok(start) => start,
                Err(outcome) => return outcome,
            }
        };
        start.await
    }

    /// Wait for an in-flight start (if any) to finish, ignoring its outcome.
    async fn settle_in_flight(&self) {
        let in_flight = self.inner.status().in_flight.clone();
        if let Some(start) = in_flight {
            let _ = start.await;
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request to the ready child. `timeout` defaults to the
    /// configured request timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, SupervisorError> {
        let transport = {
            let status = self.inner.status();
            match (&status.state, &status.transport) {
                (SupervisorState::Ready, Some(t)) => t.clone(),
                (state, _) => {
                    return Err(SupervisorError::NotReady {
                        state: state.to_string(),
                    })
                }
            }
        };
        let timeout = timeout.unwrap_or_else(|| self.inner.config.timeouts.request());
        transport.request(method, params, timeout).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn state(&self) -> SupervisorState {
        self.inner.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Ready
    }

    /// Whether a child process exists and is running.
    pub async fn is_alive(&self) -> bool {
        let mut active = self.inner.active.lock().await;
        match active.as_mut() {
            Some(process) => process.handle.is_alive() && !process.transport.is_closed(),
            None => false,
        }
    }

    /// The tier of the running process, `None` when there is none.
    pub fn active_tier(&self) -> ClientTier {
        self.inner.status().tier
    }

    /// Incremented every time a new process becomes ready.
    pub fn generation(&self) -> u64 {
        self.inner.status().generation
    }

    /// How many times the launch chain has run.
    pub fn launch_count(&self) -> u64 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Requests awaiting a response from the current process.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .status()
            .transport
            .as_ref()
            .map_or(0, |t| t.pending_count())
    }

    /// Server identity reported by the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.status().server.clone()
    }

    /// The error from the most recent failed start.
    pub fn last_error(&self) -> Option<SupervisorError> {
        self.inner.status().last_error.clone()
    }
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// Body of the shared start future.
async fn run_start(inner: Arc<Inner>) -> Result<ClientTier, SupervisorError> {
    let overrides = inner.status().overrides.clone();

    let launched = async {
        let bundle = environment::resolve_from_process(&overrides, &inner.config.environment)?;
        inner.launches.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            tool = %inner.config.name,
            tiers = ?inner.chain.tiers(),
            "launching"
        );
        inner.chain.launch(&bundle, &inner.sink).await
    }
    .await;

    match launched {
        Ok(outcome) => Ok(install(&inner, outcome).await),
        Err(err) => {
            tracing::error!(tool = %inner.config.name, error = %err, "start failed");
            let event = {
                let mut status = inner.status();
                status.in_flight = None;
                status.tier = ClientTier::None;
                status.transport = None;
                status.last_error = Some(err.clone());
                status.transition(SupervisorState::Failed)
            };
            inner.emit(event);
            Err(err)
        }
    }
}

/// Make a launched process the active one and enter `Ready`.
async fn install(inner: &Arc<Inner>, outcome: LaunchOutcome) -> ClientTier {
    let LaunchOutcome {
        tier,
        handle,
        transport,
        server,
        ..
    } = outcome;
    let pid = handle.pid();

    let mut active = inner.active.lock().await;
    let generation = inner.status().generation + 1;
    let monitor = spawn_exit_monitor(Arc::downgrade(inner), transport.clone(), generation);
    *active = Some(ActiveProcess {
        generation,
        tier,
        handle,
        transport: transport.clone(),
        monitor,
    });

    let event = {
        let mut status = inner.status();
        status.generation = generation;
        status.tier = tier;
        status.transport = Some(transport);
        status.server = server.server_info;
        status.last_error = None;
        status.in_flight = None;
        status.transition(SupervisorState::Ready)
    };
    drop(active);

    inner.emit(event);
    inner.emit(Some(SupervisorEvent::TierActivated { tier, pid }));
    tracing::info!(tool = %inner.config.name, tier = %tier, pid, generation, "supervisor ready");
    tier
}

/// Watch for the child's stdout closing and retire the process.
fn spawn_exit_monitor(
    inner: Weak<Inner>,
    transport: Arc<StdioTransport>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rejected = transport.closed().await;
        drop(transport);
        if let Some(inner) = inner.upgrade() {
            on_process_exit(&inner, generation, rejected).await;
        }
    })
}

async fn on_process_exit(inner: &Arc<Inner>, generation: u64, rejected: usize) {
    let taken = {
        let mut active = inner.active.lock().await;
        match active.as_ref() {
            Some(process) if process.generation == generation => active.take(),
            _ => None,
        }
    };
    let Some(mut process) = taken else {
        return; // already retired by stop or restart
    };

    tracing::warn!(
        tool = %inner.config.name,
        tier = %process.tier,
        pid = process.handle.pid(),
        rejected,
        "process exited unexpectedly"
    );
    process.handle.force_kill().await;
    process.transport.shutdown();

    let event = {
        let mut status = inner.status();
        if status.generation == generation && status.state == SupervisorState::Ready {
            status.tier = ClientTier::None;
            status.transport = None;
            status.server = None;
            status.transition(SupervisorState::Idle)
        } else {
            None
        }
    };
    inner.emit(event);
    inner.emit(Some(SupervisorEvent::ProcessExited {
        tier: process.tier,
        pending_rejected: rejected,
    }));
}

/// Retire the active process: reject pending, close stdin, SIGTERM, wait,
/// SIGKILL.
async fn shutdown_active(inner: &Arc<Inner>, reason: SupervisorError) {
    let taken = inner.active.lock().await.take();
    let Some(mut process) = taken else {
        return;
    };

    process.monitor.abort();
    let rejected = process.transport.fail_pending(reason);
    if rejected > 0 {
        tracing::info!(tool = %inner.config.name, rejected, "rejected pending requests");
    }

    process.transport.close_stdin().await;
    let outcome = process
        .handle
        .shutdown(inner.config.timeouts.shutdown_grace())
        .await;
    process.transport.shutdown();

    tracing::info!(
        tool = %inner.config.name,
        tier = %process.tier,
        generation = process.generation,
        outcome = ?outcome,
        "process shut down"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
