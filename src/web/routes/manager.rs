// Worker Manager control surface: spawn, touch, stop

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;

use crate::web::models::SpawnResponse;
use crate::web::response_helpers::{error_response, json_response};
use crate::web::routes::system::handle_evict;
use crate::web::worker::Orchestrator;
use crate::{sys_info, sys_warn};

/// `POST /spawn/{alias}`: make sure a READY worker exists
pub async fn handle_spawn(orchestrator: &Arc<Orchestrator>, alias: &str) -> Result<Response<Body>, Infallible> {
    let spec = match orchestrator.spec(alias) {
        Ok(spec) => spec.clone(),
        Err(e) => return Ok(error_response(&e)),
    };

    match orchestrator.ensure(alias).await {
        Ok(info) => Ok(json_response(
            StatusCode::OK,
            &SpawnResponse {
                alias: info.alias,
                port: info.port,
                memory_bytes: info.memory_bytes,
                model_type: spec.model_type.to_string(),
            },
        )),
        Err(e) => {
            sys_warn!("[MANAGER] Spawn of {alias} failed: {e}");
            Ok(error_response(&e))
        }
    }
}

/// `POST /touch/{alias}`: refresh activity so the idle sweep leaves it alone
pub async fn handle_touch(orchestrator: &Orchestrator, alias: &str) -> Result<Response<Body>, Infallible> {
    match orchestrator.touch(alias) {
        Ok(touched) => Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "alias": alias, "touched": touched }),
        )),
        Err(e) => Ok(error_response(&e)),
    }
}

/// `POST /stop/{alias}`: same rules as the gateway's evict
pub async fn handle_stop(orchestrator: &Orchestrator, alias: &str) -> Result<Response<Body>, Infallible> {
    handle_evict(orchestrator, alias).await
}

/// `POST /stop-all`: stop every READY worker, busy or not
pub async fn handle_stop_all(orchestrator: &Orchestrator) -> Result<Response<Body>, Infallible> {
    let stopped = orchestrator.stop_all().await;
    sys_info!("[MANAGER] Stopped {stopped} worker(s)");
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "success": true, "stopped": stopped }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::worker::testing::{orchestrator_with, test_spec, FakeLauncher, FakeProbe};

    async fn json(response: Response<Body>) -> serde_json::Value {
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_touch_stop_all() {
        let orch = orchestrator_with(
            vec![test_spec("stt-fast", 9001, 1.5), test_spec("tts-fast", 9002, 1.0)],
            4.0,
            FakeLauncher::new(),
            FakeProbe::healthy(),
        );

        let spawned = handle_spawn(&orch, "stt-fast").await.unwrap();
        assert_eq!(spawned.status(), StatusCode::OK);
        let body = json(spawned).await;
        assert_eq!(body["port"], 9001);
        assert_eq!(body["model_type"], "stt");

        let touched = json(handle_touch(&orch, "stt-fast").await.unwrap()).await;
        assert_eq!(touched["touched"], true);
        let cold = json(handle_touch(&orch, "tts-fast").await.unwrap()).await;
        assert_eq!(cold["touched"], false);

        handle_spawn(&orch, "tts-fast").await.unwrap();
        let _busy = orch.acquire("tts-fast").unwrap();
        let stopped = json(handle_stop_all(&orch).await.unwrap()).await;
        assert_eq!(stopped["stopped"], 2);
        assert!(orch.snapshot().workers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_capacity_failure_is_503() {
        let orch = orchestrator_with(
            vec![test_spec("huge", 9001, 16.0)],
            4.0,
            FakeLauncher::new(),
            FakeProbe::healthy(),
        );
        let response = handle_spawn(&orch, "huge").await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("retry-after"));
    }
}
