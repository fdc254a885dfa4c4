// Voice Insight server: public gateway plus the internal worker manager,
// both driving one worker orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio_util::sync::CancellationToken;

use voice_insight::web::gateway::auth::effective_api_key;
use voice_insight::web::gateway::GatewayRouter;
use voice_insight::web::logger::{parse_level, setup_logging};
use voice_insight::web::server::{serve_gateway, serve_manager, GatewayState};
use voice_insight::web::worker::health::{HttpHealthProbe, PROBE_TIMEOUT};
use voice_insight::web::worker::health_monitor::spawn_health_monitor;
use voice_insight::web::worker::process_manager::OsProcessLauncher;
use voice_insight::web::worker::supervisor::spawn_idle_supervisor;
use voice_insight::web::worker::{Orchestrator, OrchestratorSettings};
use voice_insight::{sys_error, sys_info, sys_warn};
use voice_insight_config::{load_config, BYTES_PER_GB};

const DEFAULT_CONFIG_PATH: &str = "config.json";
const LOG_DIR: &str = "logs";

fn config_path(mut args: impl Iterator<Item = String>) -> anyhow::Result<PathBuf> {
    let mut path = PathBuf::from(DEFAULT_CONFIG_PATH);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                path = PathBuf::from(value);
            }
            other => match other.strip_prefix("--config=") {
                Some(value) => path = PathBuf::from(value),
                None => bail!("unknown argument: {other}"),
            },
        }
    }
    Ok(path)
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                sys_warn!("Could not install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path(std::env::args().skip(1))?;

    let level = parse_level(std::env::var("LOG_LEVEL").ok().as_deref());
    setup_logging(LOG_DIR, level).map_err(|e| anyhow!("failed to initialise logging: {e}"))?;

    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    let specs = config.worker_specs()?;
    let workers = &config.workers;

    for spec in &specs {
        sys_info!(
            "Model {} ({}) on port {}, {:.2} GB",
            spec.alias,
            spec.model_type,
            spec.port,
            spec.memory_bytes as f64 / BYTES_PER_GB as f64
        );
    }

    let orchestrator = Orchestrator::new(
        specs,
        config.memory.budget_bytes(),
        Arc::new(OsProcessLauncher),
        Arc::new(HttpHealthProbe::new(workers.worker_host.clone(), PROBE_TIMEOUT)),
        OrchestratorSettings::from_config(workers),
    );

    let idle = spawn_idle_supervisor(
        orchestrator.clone(),
        Duration::from_secs(workers.idle_check_interval.max(1)),
    );
    let health = spawn_health_monitor(
        orchestrator.clone(),
        Duration::from_secs(workers.health_check_interval.max(1)),
    );

    let state = Arc::new(GatewayState {
        router: GatewayRouter::new(
            orchestrator.clone(),
            workers.worker_host.clone(),
            Duration::from_secs(workers.cold_start_timeout),
            Duration::from_secs(workers.request_timeout),
        ),
        api_key: effective_api_key(&config.gateway.api_key),
    });
    if state.api_key.is_none() {
        sys_warn!("API key authentication is disabled");
    }

    let gateway_addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| format!("invalid gateway address {}:{}", config.gateway.host, config.gateway.port))?;
    let manager_addr: SocketAddr = format!("{}:{}", workers.worker_host, workers.manager_port)
        .parse()
        .with_context(|| format!("invalid manager address {}:{}", workers.worker_host, workers.manager_port))?;

    // Servers outlive the orchestrator shutdown so in-flight responses can drain.
    // A server that fails also trips the token, taking the process down.
    let stop_serving = CancellationToken::new();
    let gateway = tokio::spawn({
        let stop = stop_serving.clone();
        async move {
            if let Err(e) = serve_gateway(gateway_addr, state, stop.cancelled()).await {
                sys_error!("[GATEWAY] Server error: {e}");
                stop.cancel();
            }
        }
    });
    let manager = tokio::spawn({
        let stop = stop_serving.clone();
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = serve_manager(manager_addr, orchestrator, stop.cancelled()).await {
                sys_error!("[MANAGER] Server error: {e}");
                stop.cancel();
            }
        }
    });

    sys_info!("Voice Insight gateway on http://{gateway_addr}, manager on http://{manager_addr}");
    sys_info!("Gateway endpoints:");
    sys_info!("  GET  /healthz");
    sys_info!("  GET  /v1/models, /v1/voices, /v1/system/status");
    sys_info!("  POST /v1/audio/transcriptions, /v1/transcribe");
    sys_info!("  POST /v1/audio/speech, /v1/synthesize");
    sys_info!("  POST /v1/system/evict/{{alias}}");

    tokio::select! {
        _ = shutdown_signal() => sys_info!("Shutdown requested, stopping workers"),
        _ = stop_serving.cancelled() => sys_error!("A server stopped unexpectedly, stopping workers"),
    }

    orchestrator.shutdown().await;
    stop_serving.cancel();

    for (name, server) in [("gateway", gateway), ("manager", manager)] {
        if let Err(e) = server.await {
            sys_error!("{name} server task failed: {e}");
        }
    }
    let _ = idle.await;
    let _ = health.await;

    sys_info!("Shutdown complete");
    Ok(())
}
