//! Worker registry: alias → the one live worker instance for it.
//!
//! Plain data structure; the orchestrator owns it behind its lock and is the
//! only thing that mutates it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;
use voice_insight_config::WorkerSpec;

use super::orchestrator::WorkerLease;
use super::process_manager::ProcessHandle;
use crate::web::error::OrchestratorError;

/// Outcome of one physical spawn, shared by everyone who joined it. On
/// success it carries a lease taken at the READY transition; it is released
/// once every joiner has taken its own.
pub type SpawnOutcome = Result<Arc<WorkerLease>, OrchestratorError>;
pub type SharedSpawn = Shared<BoxFuture<'static, SpawnOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
}

/// What callers get back once a worker is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub alias: String,
    pub instance_id: u64,
    pub port: u16,
    pub memory_bytes: u64,
}

pub struct WorkerInstance {
    pub id: u64,
    pub alias: String,
    pub port: u16,
    pub state: WorkerState,
    /// `None` until launched, and again once taken for shutdown.
    pub process: Option<Box<dyn ProcessHandle>>,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub in_flight: u32,
    /// Bytes held in the budget; 0 until admission succeeds.
    pub reserved_bytes: u64,
    pub health_failures: u32,
    pub request_count: u64,
    pub idle_timeout: Duration,
    /// Present while STARTING so concurrent callers can join the spawn.
    pub spawn: Option<SharedSpawn>,
}

impl WorkerInstance {
    pub fn starting(spec: &WorkerSpec, id: u64, spawn: SharedSpawn) -> Self {
        let now = Instant::now();
        Self {
            id,
            alias: spec.alias.clone(),
            port: spec.port,
            state: WorkerState::Starting,
            process: None,
            pid: None,
            started_at: now,
            last_activity: now,
            in_flight: 0,
            reserved_bytes: 0,
            health_failures: 0,
            request_count: 0,
            idle_timeout: spec.idle_timeout,
            spawn: Some(spawn),
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            alias: self.alias.clone(),
            instance_id: self.id,
            port: self.port,
            memory_bytes: self.reserved_bytes,
        }
    }

    /// READY with nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Ready && self.in_flight == 0
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        self.is_idle() && now.saturating_duration_since(self.last_activity) > self.idle_timeout
    }
}

/// Reference to a specific instance; stale once that instance is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceKey {
    pub alias: String,
    pub id: u64,
}

/// Per-instance row of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub alias: String,
    pub instance_id: u64,
    pub state: WorkerState,
    pub port: u16,
    pub pid: Option<u32>,
    pub memory_bytes: u64,
    pub in_flight: u32,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub request_count: u64,
    pub health_failures: u32,
    pub idle_timeout_seconds: u64,
}

#[derive(Default)]
pub struct Registry {
    instances: HashMap<String, WorkerInstance>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, alias: &str) -> Option<&WorkerInstance> {
        self.instances.get(alias)
    }

    /// The instance for `key`, if it is still the live one.
    pub fn get_mut(&mut self, key: &InstanceKey) -> Option<&mut WorkerInstance> {
        self.instances
            .get_mut(&key.alias)
            .filter(|inst| inst.id == key.id)
    }

    pub fn get_alias_mut(&mut self, alias: &str) -> Option<&mut WorkerInstance> {
        self.instances.get_mut(alias)
    }

    /// Register a new instance. Refuses while the alias still has one: a
    /// second spawn must join the first.
    pub fn insert(&mut self, instance: WorkerInstance) -> Result<(), WorkerInstance> {
        if self.instances.contains_key(&instance.alias) {
            return Err(instance);
        }
        self.instances.insert(instance.alias.clone(), instance);
        Ok(())
    }

    /// Remove the instance for `key` if it is still the live one.
    pub fn remove(&mut self, key: &InstanceKey) -> Option<WorkerInstance> {
        match self.instances.get(&key.alias) {
            Some(inst) if inst.id == key.id => self.instances.remove(&key.alias),
            _ => None,
        }
    }

    pub fn keys_in_state(&self, state: WorkerState) -> Vec<InstanceKey> {
        self.instances
            .values()
            .filter(|inst| inst.state == state)
            .map(|inst| InstanceKey {
                alias: inst.alias.clone(),
                id: inst.id,
            })
            .collect()
    }

    pub fn any_in_state(&self, state: WorkerState) -> bool {
        self.instances.values().any(|inst| inst.state == state)
    }

    /// READY, idle instances other than `exclude`, least recently active first.
    pub fn evictable(&self, exclude: &str) -> Vec<InstanceKey> {
        let mut candidates: Vec<&WorkerInstance> = self
            .instances
            .values()
            .filter(|inst| inst.alias != exclude && inst.is_idle())
            .collect();
        candidates.sort_by_key(|inst| inst.last_activity);
        candidates
            .into_iter()
            .map(|inst| InstanceKey {
                alias: inst.alias.clone(),
                id: inst.id,
            })
            .collect()
    }

    /// READY, idle instances whose idle timeout has passed at `now`.
    pub fn idle_expired(&self, now: Instant) -> Vec<InstanceKey> {
        self.instances
            .values()
            .filter(|inst| inst.idle_expired(now))
            .map(|inst| InstanceKey {
                alias: inst.alias.clone(),
                id: inst.id,
            })
            .collect()
    }

    pub fn total_in_flight(&self) -> u32 {
        self.instances.values().map(|inst| inst.in_flight).sum()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<WorkerSnapshot> {
        let mut rows: Vec<WorkerSnapshot> = self
            .instances
            .values()
            .map(|inst| WorkerSnapshot {
                alias: inst.alias.clone(),
                instance_id: inst.id,
                state: inst.state,
                port: inst.port,
                pid: inst.pid,
                memory_bytes: inst.reserved_bytes,
                in_flight: inst.in_flight,
                uptime_seconds: now.saturating_duration_since(inst.started_at).as_secs(),
                idle_seconds: now.saturating_duration_since(inst.last_activity).as_secs(),
                request_count: inst.request_count,
                health_failures: inst.health_failures,
                idle_timeout_seconds: inst.idle_timeout.as_secs(),
            })
            .collect();
        rows.sort_by(|a, b| a.alias.cmp(&b.alias));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::worker::testing::test_spec;
    use futures_util::FutureExt;

    fn instance(alias: &str, id: u64) -> WorkerInstance {
        let spec = test_spec(alias, 9000, 1.0);
        let spawn = futures_util::future::pending::<SpawnOutcome>().boxed().shared();
        WorkerInstance::starting(&spec, id, spawn)
    }

    fn ready(alias: &str, id: u64, idle_for: Duration) -> WorkerInstance {
        let mut inst = instance(alias, id);
        inst.state = WorkerState::Ready;
        inst.spawn = None;
        inst.last_activity = Instant::now() - idle_for;
        inst
    }

    fn key(alias: &str, id: u64) -> InstanceKey {
        InstanceKey {
            alias: alias.to_string(),
            id,
        }
    }

    #[test]
    fn test_one_instance_per_alias() {
        let mut registry = Registry::new();
        assert!(registry.insert(instance("stt-fast", 1)).is_ok());
        let rejected = registry.insert(instance("stt-fast", 2)).unwrap_err();
        assert_eq!(rejected.id, 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("stt-fast").map(|i| i.id), Some(1));
    }

    #[test]
    fn test_stale_key_does_not_remove_successor() {
        let mut registry = Registry::new();
        registry.insert(instance("tts-fast", 1)).ok();
        assert!(registry.remove(&key("tts-fast", 1)).is_some());
        registry.insert(instance("tts-fast", 2)).ok();
        assert!(registry.remove(&key("tts-fast", 1)).is_none());
        assert!(registry.get_mut(&key("tts-fast", 1)).is_none());
        assert!(registry.get_mut(&key("tts-fast", 2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictable_orders_oldest_first_and_skips_busy() {
        tokio::time::advance(Duration::from_secs(1000)).await;
        let mut registry = Registry::new();
        registry.insert(ready("a", 1, Duration::from_secs(10))).ok();
        registry.insert(ready("b", 2, Duration::from_secs(500))).ok();
        let mut busy = ready("c", 3, Duration::from_secs(900));
        busy.in_flight = 1;
        registry.insert(busy).ok();
        registry.insert(instance("d", 4)).ok();
        registry.insert(ready("e", 5, Duration::from_secs(100))).ok();

        let order: Vec<String> = registry
            .evictable("e")
            .into_iter()
            .map(|k| k.alias)
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expired_ignores_in_flight() {
        tokio::time::advance(Duration::from_secs(10_000)).await;
        let mut registry = Registry::new();
        // test_spec uses a 300s idle timeout
        registry.insert(ready("stale", 1, Duration::from_secs(301))).ok();
        registry.insert(ready("fresh", 2, Duration::from_secs(299))).ok();
        let mut busy = ready("busy", 3, Duration::from_secs(5000));
        busy.in_flight = 2;
        registry.insert(busy).ok();

        let expired: Vec<String> = registry
            .idle_expired(Instant::now())
            .into_iter()
            .map(|k| k.alias)
            .collect();
        assert_eq!(expired, vec!["stale"]);
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut registry = Registry::new();
        registry.insert(instance("zeta", 1)).ok();
        registry.insert(instance("alpha", 2)).ok();
        let rows = registry.snapshot(Instant::now());
        assert_eq!(rows[0].alias, "alpha");
        assert_eq!(rows[1].state, WorkerState::Starting);
    }
}
