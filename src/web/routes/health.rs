// Liveness route handlers

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::web::response_helpers::json_raw;

/// Gateway `GET /healthz`
pub async fn handle_healthz() -> Result<Response<Body>, Infallible> {
    Ok(json_raw(
        StatusCode::OK,
        r#"{"status":"healthy","service":"voice-insight-gateway"}"#.to_string(),
    ))
}

/// Manager `GET /health`
pub async fn handle_manager_health() -> Result<Response<Body>, Infallible> {
    Ok(json_raw(
        StatusCode::OK,
        r#"{"status":"healthy","service":"voice-insight-manager"}"#.to_string(),
    ))
}
