//! Idle-timeout supervisor.
//!
//! A fixed-interval ticker, independent of request traffic. Only READY
//! instances with nothing in flight are ever considered.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::Orchestrator;
use crate::{sys_debug, sys_info};

/// One pass: stop every idle instance past its timeout. Returns how many
/// were stopped.
pub async fn run_idle_sweep(orchestrator: &Orchestrator) -> usize {
    let expired = orchestrator.begin_idle_stops();
    if expired.is_empty() {
        return 0;
    }

    for (key, _) in &expired {
        sys_info!("[IDLE] {}: idle timeout reached, STOPPING", key.alias);
    }
    let count = expired.len();
    join_all(
        expired
            .into_iter()
            .map(|(key, process)| async move { orchestrator.finish_stop(&key, process).await }),
    )
    .await;
    count
}

/// Run [`run_idle_sweep`] every `every` until the orchestrator shuts down.
pub fn spawn_idle_supervisor(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    let token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; nothing can be idle yet
        ticker.tick().await;

        sys_debug!("[IDLE] Supervisor running every {every:?}");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let stopped = run_idle_sweep(&orchestrator).await;
                    if stopped > 0 {
                        sys_debug!("[IDLE] Sweep stopped {stopped} worker(s)");
                    }
                }
            }
        }
        sys_debug!("[IDLE] Supervisor stopped");
    })
}
