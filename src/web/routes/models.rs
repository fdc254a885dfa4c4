// Static catalog route handlers: no orchestration involved

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::web::models::{ModelInfo, ModelList, VoiceList, VOICE_CATALOG};
use crate::web::response_helpers::json_response;
use crate::web::worker::Orchestrator;

pub async fn handle_list_models(orchestrator: &Orchestrator) -> Result<Response<Body>, Infallible> {
    let data = orchestrator
        .specs()
        .iter()
        .map(|spec| ModelInfo {
            id: spec.alias.clone(),
            object: "model",
            model_type: spec.model_type.to_string(),
            path: spec.model_path.clone(),
        })
        .collect();

    Ok(json_response(StatusCode::OK, &ModelList { object: "list", data }))
}

pub async fn handle_list_voices() -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &VoiceList { voices: VOICE_CATALOG }))
}
