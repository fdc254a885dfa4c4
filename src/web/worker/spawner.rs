//! Spawner: admission, launch, and health polling for one cold start.
//!
//! Runs on its own task (see `Orchestrator::ensure`), so a caller giving up
//! never aborts a spawn other callers may be waiting on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use voice_insight_config::WorkerSpec;

use super::orchestrator::Orchestrator;
use super::process_manager::{shutdown_process, ProcessHandle};
use super::registry::{InstanceKey, SpawnOutcome, WorkerState};
use crate::web::error::OrchestratorError;
use crate::{sys_debug, sys_info, sys_warn};

enum AdmitStep {
    Evict(InstanceKey, Option<Box<dyn ProcessHandle>>),
    Wait,
}

impl Orchestrator {
    pub(super) async fn run_spawn(self: Arc<Self>, spec: Arc<WorkerSpec>, id: u64) -> SpawnOutcome {
        let key = InstanceKey {
            alias: spec.alias.clone(),
            id,
        };

        let outcome = match self.bring_up(&spec, &key).await {
            Ok(()) => self.mark_ready(&key),
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            sys_warn!("[SPAWNER] {}: spawn failed: {e}", key.alias);
            self.abandon_spawn(&key).await;
        }
        outcome
    }

    async fn bring_up(&self, spec: &WorkerSpec, key: &InstanceKey) -> Result<(), OrchestratorError> {
        self.reserve(spec, key).await?;

        let process = self
            .launcher
            .spawn(spec)
            .map_err(|reason| OrchestratorError::SpawnFailed {
                alias: key.alias.clone(),
                reason,
            })?;

        let orphan = {
            let mut state = self.lock();
            match state.registry.get_mut(key) {
                Some(inst) => {
                    inst.pid = process.pid();
                    inst.process = Some(process);
                    None
                }
                None => Some(process),
            }
        };
        if let Some(mut orphan) = orphan {
            shutdown_process(orphan.as_mut(), Duration::ZERO).await;
            return Err(Self::shutting_down_error());
        }

        self.wait_healthy(spec, key).await
    }

    /// Reserve the spec's memory, evicting idle instances (least recently
    /// active first) until it fits. Evictions already done stay done even if
    /// admission ultimately fails.
    async fn reserve(&self, spec: &WorkerSpec, key: &InstanceKey) -> Result<(), OrchestratorError> {
        let bytes = spec.memory_bytes;

        loop {
            if self.is_shutting_down() {
                return Err(Self::shutting_down_error());
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut guard = self.lock();
                let state = &mut *guard;

                if !state.budget.can_ever_fit(bytes) {
                    sys_warn!(
                        "[SPAWNER] {}: needs {bytes} bytes, more than the whole budget ({})",
                        key.alias,
                        state.budget.total_bytes()
                    );
                    return Err(OrchestratorError::InsufficientCapacity {
                        alias: key.alias.clone(),
                        requested_bytes: bytes,
                        available_bytes: state.budget.available_bytes(),
                    });
                }

                match state.budget.try_reserve(&key.alias, key.id, bytes) {
                    Ok(()) => {
                        let Some(inst) = state.registry.get_mut(key) else {
                            state.budget.release(&key.alias, key.id);
                            return Err(Self::shutting_down_error());
                        };
                        inst.reserved_bytes = bytes;
                        sys_debug!(
                            "[SPAWNER] {}: reserved {bytes} bytes ({} available)",
                            key.alias,
                            state.budget.available_bytes()
                        );
                        return Ok(());
                    }
                    Err(shortfall) => {
                        if let Some(victim) = state.registry.evictable(&key.alias).into_iter().next() {
                            let process = Self::begin_stop_locked(state, &victim);
                            AdmitStep::Evict(victim, process)
                        } else if state.registry.any_in_state(WorkerState::Stopping) {
                            AdmitStep::Wait
                        } else {
                            sys_warn!(
                                "[SPAWNER] {}: admission denied, {} bytes requested, {} available",
                                key.alias,
                                shortfall.requested,
                                shortfall.available
                            );
                            return Err(OrchestratorError::InsufficientCapacity {
                                alias: key.alias.clone(),
                                requested_bytes: shortfall.requested,
                                available_bytes: shortfall.available,
                            });
                        }
                    }
                }
            };

            match step {
                AdmitStep::Evict(victim, process) => {
                    sys_info!("[SPAWNER] Evicting idle {} to make room for {}", victim.alias, key.alias);
                    self.finish_stop(&victim, process).await;
                }
                AdmitStep::Wait => notified.await,
            }
        }
    }

    /// Poll the health endpoint with exponential backoff until it answers,
    /// the process dies, or the startup deadline passes.
    async fn wait_healthy(&self, spec: &WorkerSpec, key: &InstanceKey) -> Result<(), OrchestratorError> {
        let timeout = self.settings.startup_timeout;
        let deadline = Instant::now() + timeout;
        let mut delay = self.settings.backoff_initial;

        loop {
            if let Some(status) = self.spawn_exit_status(key) {
                return Err(OrchestratorError::SpawnFailed {
                    alias: key.alias.clone(),
                    reason: format!("process exited before becoming healthy ({status})"),
                });
            }

            if self.probe.probe(spec.port).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::SpawnTimeout {
                    alias: key.alias.clone(),
                    seconds: timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Self::shutting_down_error()),
                _ = tokio::time::sleep(delay.min(deadline - now)) => {}
            }
            delay = (delay * 2).min(self.settings.backoff_max);
        }
    }

    /// Exit status of the spawning process, or a reason if the instance is gone.
    fn spawn_exit_status(&self, key: &InstanceKey) -> Option<String> {
        let mut state = self.lock();
        match state.registry.get_mut(key) {
            Some(inst) => inst.process.as_mut().and_then(|p| p.try_exit_status()),
            None => Some("instance removed".to_string()),
        }
    }

    /// READY, with the first lease taken under the same lock so nothing can
    /// evict the instance before its joiners get to it.
    fn mark_ready(self: &Arc<Self>, key: &InstanceKey) -> SpawnOutcome {
        let (grant, spawn) = {
            let mut state = self.lock();
            // Checked under the lock so shutdown's stop pass cannot miss us
            if self.is_shutting_down() {
                return Err(Self::shutting_down_error());
            }
            let Some(inst) = state.registry.get_mut(key) else {
                return Err(Self::shutting_down_error());
            };
            inst.state = WorkerState::Ready;
            inst.health_failures = 0;
            sys_info!(
                "[SPAWNER] {}: READY on port {} after {:.1}s",
                key.alias,
                inst.port,
                Instant::now().saturating_duration_since(inst.started_at).as_secs_f64()
            );
            let spawn = inst.spawn.take();
            (self.lease_locked(inst, false), spawn)
        };
        drop(spawn);
        self.changed.notify_waiters();
        Ok(Arc::new(grant))
    }

    /// Kill whatever was launched, then drop the entry and its reservation.
    async fn abandon_spawn(&self, key: &InstanceKey) {
        let process = {
            let mut state = self.lock();
            state.registry.get_mut(key).and_then(|inst| inst.process.take())
        };
        if let Some(mut process) = process {
            shutdown_process(process.as_mut(), self.settings.shutdown_grace).await;
        }
        self.remove_instance(key);
    }
}
