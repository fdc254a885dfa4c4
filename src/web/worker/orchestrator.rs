//! The orchestrator: one lock over the registry and the memory budget.
//!
//! Every state transition goes through here. The gateway, the manager
//! endpoints, and both background sweeps only ever call these methods; none
//! of them touch an instance directly. The lock is a plain `std` mutex and is
//! never held across an `.await`: anything slow (process shutdown, health
//! probes, proxying) happens after the guard is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use voice_insight_config::{WorkerSpec, WorkersConfig};

use super::budget::{BudgetSnapshot, MemoryBudget};
use super::health::HealthProbe;
use super::process_manager::{shutdown_process, ProcessHandle, ProcessLauncher};
use super::registry::{
    InstanceKey, Registry, SharedSpawn, WorkerInfo, WorkerInstance, WorkerSnapshot, WorkerState,
};
use crate::web::error::OrchestratorError;
use crate::{sys_debug, sys_info, sys_warn};

/// Extra time granted at shutdown for spawns to notice and clean up.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub health_failure_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            health_failure_threshold: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(workers: &WorkersConfig) -> Self {
        Self {
            startup_timeout: Duration::from_secs(workers.startup_timeout),
            shutdown_grace: Duration::from_secs(workers.shutdown_grace_seconds),
            health_failure_threshold: workers.health_failure_threshold.max(1),
            ..Self::default()
        }
    }
}

pub(super) struct OrchestratorState {
    pub(super) registry: Registry,
    pub(super) budget: MemoryBudget,
}

/// Result of an explicit eviction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Nothing was running for the alias.
    NotRunning,
    /// Another task is already stopping it.
    AlreadyStopping,
    Stopped { freed_bytes: u64 },
}

/// Body of the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub budget: BudgetSnapshot,
    pub shutting_down: bool,
}

enum EnsureStep {
    Join(SharedSpawn),
    Wait,
}

pub struct Orchestrator {
    pub(super) state: Mutex<OrchestratorState>,
    /// Pulsed on every registry change that a waiter might care about.
    pub(super) changed: Notify,
    pub(super) specs: HashMap<String, Arc<WorkerSpec>>,
    pub(super) launcher: Arc<dyn ProcessLauncher>,
    pub(super) probe: Arc<dyn HealthProbe>,
    pub(super) settings: OrchestratorSettings,
    next_id: AtomicU64,
    pub(super) shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        specs: Vec<WorkerSpec>,
        budget_bytes: u64,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let specs = specs
            .into_iter()
            .map(|spec| (spec.alias.clone(), Arc::new(spec)))
            .collect();
        Arc::new(Self {
            state: Mutex::new(OrchestratorState {
                registry: Registry::new(),
                budget: MemoryBudget::new(budget_bytes),
            }),
            changed: Notify::new(),
            specs,
            launcher,
            probe,
            settings,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spec(&self, alias: &str) -> Result<&Arc<WorkerSpec>, OrchestratorError> {
        self.specs
            .get(alias)
            .ok_or_else(|| OrchestratorError::UnknownAlias(alias.to_string()))
    }

    /// Configured specs ordered by alias.
    pub fn specs(&self) -> Vec<Arc<WorkerSpec>> {
        let mut specs: Vec<_> = self.specs.values().cloned().collect();
        specs.sort_by(|a, b| a.alias.cmp(&b.alias));
        specs
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(super) fn shutting_down_error() -> OrchestratorError {
        OrchestratorError::ServiceUnavailable("worker manager is shutting down".to_string())
    }

    /// Return a READY instance for `alias`, spawning one if needed.
    ///
    /// Concurrent callers for a cold alias all join the same spawn and get
    /// the same outcome. Dropping the returned future only abandons the wait;
    /// the spawn itself keeps running.
    pub async fn ensure(self: &Arc<Self>, alias: &str) -> Result<WorkerInfo, OrchestratorError> {
        self.claim(alias, false).await.map(|lease| lease.info().clone())
    }

    /// [`ensure`](Self::ensure), then register a request against the
    /// instance. A freshly spawned instance is handed over still holding the
    /// spawn's own lease, so it cannot be evicted between READY and here.
    pub async fn lease(self: &Arc<Self>, alias: &str) -> Result<WorkerLease, OrchestratorError> {
        self.claim(alias, true).await
    }

    async fn claim(self: &Arc<Self>, alias: &str, count_request: bool) -> Result<WorkerLease, OrchestratorError> {
        let spec = Arc::clone(self.spec(alias)?);

        loop {
            if self.is_shutting_down() {
                return Err(Self::shutting_down_error());
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.lock();
                match state.registry.get_alias_mut(alias) {
                    Some(inst) => match inst.state {
                        WorkerState::Ready => return Ok(self.lease_locked(inst, count_request)),
                        WorkerState::Starting => match &inst.spawn {
                            Some(spawn) => EnsureStep::Join(spawn.clone()),
                            None => EnsureStep::Wait,
                        },
                        // Wait for it to be gone, then spawn fresh
                        WorkerState::Stopping => EnsureStep::Wait,
                    },
                    None => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let spawn = self.start_spawn(Arc::clone(&spec), id);
                        let instance = WorkerInstance::starting(&spec, id, spawn.clone());
                        if state.registry.insert(instance).is_err() {
                            // Unreachable while we hold the lock
                            EnsureStep::Wait
                        } else {
                            sys_info!("[SPAWNER] {alias}: cold start (instance {id})");
                            EnsureStep::Join(spawn)
                        }
                    }
                }
            };

            match step {
                EnsureStep::Join(spawn) => {
                    let grant = spawn.await?;
                    return self.lease_key(grant.key(), count_request).ok_or_else(|| {
                        OrchestratorError::ServiceUnavailable(format!("{alias} stopped before the request was sent"))
                    });
                }
                EnsureStep::Wait => notified.await,
            }
        }
    }

    /// Run the spawn on its own task so no single waiter can cancel it.
    fn start_spawn(self: &Arc<Self>, spec: Arc<WorkerSpec>, id: u64) -> SharedSpawn {
        let key = InstanceKey {
            alias: spec.alias.clone(),
            id,
        };
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(Arc::clone(self).run_spawn(spec, id));

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    orchestrator.remove_instance(&key);
                    Err(OrchestratorError::SpawnFailed {
                        alias: key.alias.clone(),
                        reason: format!("spawn task failed: {e}"),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Register a request against a READY instance. `None` if there is no
    /// READY instance or the manager is shutting down.
    pub fn acquire(self: &Arc<Self>, alias: &str) -> Option<WorkerLease> {
        if self.is_shutting_down() {
            return None;
        }
        let mut state = self.lock();
        let inst = state
            .registry
            .get_alias_mut(alias)
            .filter(|inst| inst.state == WorkerState::Ready)?;
        Some(self.lease_locked(inst, true))
    }

    /// Lease exactly the instance `key` names, if it is still READY.
    pub(super) fn lease_key(self: &Arc<Self>, key: &InstanceKey, count_request: bool) -> Option<WorkerLease> {
        let mut state = self.lock();
        let inst = state
            .registry
            .get_mut(key)
            .filter(|inst| inst.state == WorkerState::Ready)?;
        Some(self.lease_locked(inst, count_request))
    }

    /// Bump in-flight on `inst`. Caller holds the lock.
    pub(super) fn lease_locked(self: &Arc<Self>, inst: &mut WorkerInstance, count_request: bool) -> WorkerLease {
        inst.in_flight += 1;
        if count_request {
            inst.request_count += 1;
        }
        inst.last_activity = Instant::now();
        WorkerLease {
            orchestrator: Arc::clone(self),
            key: InstanceKey {
                alias: inst.alias.clone(),
                id: inst.id,
            },
            info: inst.info(),
        }
    }

    fn release_lease(&self, key: &InstanceKey) {
        {
            let mut state = self.lock();
            if let Some(inst) = state.registry.get_mut(key) {
                inst.in_flight = inst.in_flight.saturating_sub(1);
                inst.last_activity = Instant::now();
            }
        }
        self.changed.notify_waiters();
    }

    /// Refresh last-activity of a READY instance.
    pub fn touch(&self, alias: &str) -> Result<bool, OrchestratorError> {
        self.spec(alias)?;
        let mut state = self.lock();
        match state.registry.get_alias_mut(alias) {
            Some(inst) if inst.state == WorkerState::Ready => {
                inst.last_activity = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove an instance and release its reservation, under the lock.
    pub(super) fn remove_locked(state: &mut OrchestratorState, key: &InstanceKey) -> Option<(WorkerInstance, u64)> {
        let inst = state.registry.remove(key)?;
        let freed = state.budget.release(&key.alias, key.id);
        Some((inst, freed))
    }

    pub(super) fn remove_instance(&self, key: &InstanceKey) -> u64 {
        let freed = {
            let mut state = self.lock();
            Self::remove_locked(&mut state, key).map_or(0, |(_, freed)| freed)
        };
        self.changed.notify_waiters();
        freed
    }

    /// Mark an instance STOPPING and take its process for shutdown.
    pub(super) fn begin_stop_locked(
        state: &mut OrchestratorState,
        key: &InstanceKey,
    ) -> Option<Box<dyn ProcessHandle>> {
        let inst = state.registry.get_mut(key)?;
        inst.state = WorkerState::Stopping;
        inst.process.take()
    }

    /// Terminate (with grace) the taken process, then remove the instance
    /// and release its memory. Returns the bytes freed.
    pub(super) async fn finish_stop(&self, key: &InstanceKey, process: Option<Box<dyn ProcessHandle>>) -> u64 {
        if let Some(mut process) = process {
            let outcome = shutdown_process(process.as_mut(), self.settings.shutdown_grace).await;
            sys_debug!("[REGISTRY] {}: process shutdown {:?}", key.alias, outcome);
        }
        let freed = self.remove_instance(key);
        sys_info!("[REGISTRY] {}: stopped and removed, freed {freed} bytes", key.alias);
        freed
    }

    /// Declare a READY instance CRASHED: remove it and release its memory at
    /// once, then kill whatever is left of the process in the background.
    /// Returns false if the instance is not (or no longer) the READY one.
    pub fn mark_crashed(&self, key: &InstanceKey, reason: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let ready = state
                .registry
                .get(&key.alias)
                .is_some_and(|inst| inst.id == key.id && inst.state == WorkerState::Ready);
            if ready {
                Self::remove_locked(&mut state, key)
            } else {
                None
            }
        };
        let Some((mut inst, freed)) = removed else {
            return false;
        };
        self.changed.notify_waiters();
        sys_warn!(
            "[REGISTRY] {}: CRASHED ({reason}); released {freed} bytes, {} request(s) in flight",
            key.alias,
            inst.in_flight
        );

        if let Some(mut process) = inst.process.take() {
            tokio::spawn(async move {
                shutdown_process(process.as_mut(), Duration::ZERO).await;
            });
        }
        true
    }

    /// Explicit eviction: refuses while the instance is starting or busy.
    pub async fn evict(&self, alias: &str) -> Result<EvictOutcome, OrchestratorError> {
        self.spec(alias)?;
        let (key, process) = {
            let mut state = self.lock();
            let Some(inst) = state.registry.get(alias) else {
                return Ok(EvictOutcome::NotRunning);
            };
            match inst.state {
                WorkerState::Stopping => return Ok(EvictOutcome::AlreadyStopping),
                WorkerState::Starting => {
                    return Err(OrchestratorError::Conflict(format!("{alias} is still starting")));
                }
                WorkerState::Ready if inst.in_flight > 0 => {
                    return Err(OrchestratorError::Conflict(format!(
                        "{alias} has {} request(s) in flight",
                        inst.in_flight
                    )));
                }
                WorkerState::Ready => {}
            }
            let key = InstanceKey {
                alias: inst.alias.clone(),
                id: inst.id,
            };
            let process = Self::begin_stop_locked(&mut state, &key);
            (key, process)
        };
        sys_info!("[REGISTRY] {alias}: explicit eviction, STOPPING");
        let freed_bytes = self.finish_stop(&key, process).await;
        Ok(EvictOutcome::Stopped { freed_bytes })
    }

    /// Stop every READY instance, busy or not. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let stops: Vec<_> = {
            let mut state = self.lock();
            state
                .registry
                .keys_in_state(WorkerState::Ready)
                .into_iter()
                .map(|key| {
                    let process = Self::begin_stop_locked(&mut state, &key);
                    (key, process)
                })
                .collect()
        };
        let count = stops.len();
        join_all(
            stops
                .into_iter()
                .map(|(key, process)| async move { self.finish_stop(&key, process).await }),
        )
        .await;
        count
    }

    /// Wait until `done` holds for the locked state.
    pub(super) async fn wait_until<F>(&self, done: F)
    where
        F: Fn(&OrchestratorState) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(&*self.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new work, let in-flight requests drain for the grace period,
    /// stop everything, and wait for pending spawns to clean up.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        sys_info!("[REGISTRY] Shutting down worker manager");
        self.shutdown.cancel();
        self.changed.notify_waiters();

        let grace = self.settings.shutdown_grace;
        let drained = tokio::time::timeout(grace, self.wait_until(|s| s.registry.total_in_flight() == 0)).await;
        if drained.is_err() {
            sys_warn!("[REGISTRY] In-flight requests did not drain within {grace:?}");
        }

        let stopped = self.stop_all().await;

        let settled = tokio::time::timeout(grace + SHUTDOWN_SLACK, self.wait_until(|s| s.registry.is_empty())).await;
        if settled.is_err() {
            sys_warn!("[REGISTRY] Some workers were still winding down at exit");
        }
        sys_info!("[REGISTRY] Shutdown complete, stopped {stopped} worker(s)");
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            workers: state.registry.snapshot(Instant::now()),
            budget: state.budget.snapshot(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// READY instances with their ports, for the health sweep. Instances
    /// whose process has already exited are returned separately.
    pub(super) fn health_targets(&self) -> (Vec<(InstanceKey, u16)>, Vec<(InstanceKey, String)>) {
        let mut state = self.lock();
        let mut alive = Vec::new();
        let mut exited = Vec::new();
        for key in state.registry.keys_in_state(WorkerState::Ready) {
            let Some(inst) = state.registry.get_mut(&key) else {
                continue;
            };
            let status = inst.process.as_mut().and_then(|p| p.try_exit_status());
            match status {
                Some(status) => exited.push((key, status)),
                None => alive.push((key, inst.port)),
            }
        }
        (alive, exited)
    }

    /// Apply one probe result. Returns the failure count once it reaches the
    /// threshold, meaning the caller should declare the instance crashed.
    pub(super) fn record_probe(&self, key: &InstanceKey, healthy: bool) -> Option<u32> {
        let mut state = self.lock();
        let inst = state
            .registry
            .get_mut(key)
            .filter(|inst| inst.state == WorkerState::Ready)?;
        if healthy {
            inst.health_failures = 0;
            return None;
        }
        inst.health_failures += 1;
        sys_debug!(
            "[HEALTH] {}: probe failed ({}/{})",
            key.alias,
            inst.health_failures,
            self.settings.health_failure_threshold
        );
        (inst.health_failures >= self.settings.health_failure_threshold).then_some(inst.health_failures)
    }

    /// Move every idle-expired instance to STOPPING in one locked pass.
    pub(super) fn begin_idle_stops(&self) -> Vec<(InstanceKey, Option<Box<dyn ProcessHandle>>)> {
        let mut state = self.lock();
        let now = Instant::now();
        state
            .registry
            .idle_expired(now)
            .into_iter()
            .map(|key| {
                let process = Self::begin_stop_locked(&mut state, &key);
                (key, process)
            })
            .collect()
    }
}

/// A request registered against a READY instance. Holds the in-flight count
/// up until dropped, wherever that happens.
pub struct WorkerLease {
    orchestrator: Arc<Orchestrator>,
    key: InstanceKey,
    info: WorkerInfo,
}

impl WorkerLease {
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.orchestrator.release_lease(&self.key);
    }
}
