//! Health monitor: periodic liveness probes of READY workers.
//!
//! Probes run outside the lock; results are applied afterwards and only to
//! the instance that was probed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::Orchestrator;
use crate::{sys_debug, sys_warn};

/// One pass over every READY instance. Returns how many were declared
/// crashed.
pub async fn run_health_sweep(orchestrator: &Orchestrator) -> usize {
    let (alive, exited) = orchestrator.health_targets();
    let mut crashed = 0;

    for (key, status) in exited {
        if orchestrator.mark_crashed(&key, &format!("process exited ({status})")) {
            crashed += 1;
        }
    }

    let probes = alive.into_iter().map(|(key, port)| async move {
        let healthy = orchestrator.probe.probe(port).await;
        (key, healthy)
    });
    for (key, healthy) in join_all(probes).await {
        if let Some(failures) = orchestrator.record_probe(&key, healthy) {
            sys_warn!("[HEALTH] {}: {failures} consecutive failed probes", key.alias);
            if orchestrator.mark_crashed(&key, "health check failed") {
                crashed += 1;
            }
        }
    }
    crashed
}

/// Run [`run_health_sweep`] every `every` until the orchestrator shuts down.
pub fn spawn_health_monitor(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    let token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        sys_debug!("[HEALTH] Monitor running every {every:?}");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    run_health_sweep(&orchestrator).await;
                }
            }
        }
        sys_debug!("[HEALTH] Monitor stopped");
    })
}
