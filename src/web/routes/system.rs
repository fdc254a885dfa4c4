// Status and eviction route handlers, shared by the gateway and the manager

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::web::models::EvictResponse;
use crate::web::response_helpers::{error_response, json_response};
use crate::web::worker::{EvictOutcome, Orchestrator};
use crate::sys_info;

/// Registry snapshot plus budget usage
pub async fn handle_status(orchestrator: &Orchestrator) -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &orchestrator.snapshot()))
}

/// Explicit eviction: 409 while the worker is busy or still starting
pub async fn handle_evict(orchestrator: &Orchestrator, alias: &str) -> Result<Response<Body>, Infallible> {
    let outcome = match orchestrator.evict(alias).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(error_response(&e)),
    };

    let (outcome, freed_bytes) = match outcome {
        EvictOutcome::NotRunning => ("not_running", 0),
        EvictOutcome::AlreadyStopping => ("already_stopping", 0),
        EvictOutcome::Stopped { freed_bytes } => ("stopped", freed_bytes),
    };
    sys_info!("[SYSTEM] Evict {alias}: {outcome}");

    Ok(json_response(
        StatusCode::OK,
        &EvictResponse {
            success: true,
            alias: alias.to_string(),
            outcome,
            freed_bytes,
        },
    ))
}
