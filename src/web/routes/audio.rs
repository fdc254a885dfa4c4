// Audio route handlers: translate the OpenAI-style surface onto worker calls

use base64::Engine as _;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;

use crate::sys_debug;
use crate::web::error::OrchestratorError;
use crate::web::gateway::{GatewayRouter, ProxyRequest};
use crate::web::models::{
    SpeechRequest, SynthesizeRequest, TranscribeRequest, WorkerAudio, WorkerSynthesizeRequest,
    DEFAULT_STT_MODEL,
};
use crate::web::request_parsing::{
    multipart_boundary, multipart_field, parse_json_body, parse_json_bytes, read_body,
};
use crate::web::response_helpers::{add_cors, binary_response, error_response, json_error};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";

/// Handlers build their error responses early and bail with `?`.
type HandlerResult = Result<Response<Body>, Response<Body>>;

fn settle(result: HandlerResult) -> Result<Response<Body>, Infallible> {
    Ok(result.unwrap_or_else(|response| response))
}

/// Send to the worker, passing its reply (any status) straight back.
async fn forward(router: &GatewayRouter, alias: &str, request: ProxyRequest) -> HandlerResult {
    let mut response = router
        .route(alias, request)
        .await
        .map_err(|e| error_response(&e))?;
    add_cors(&mut response);
    Ok(response)
}

fn synthesize_call(worker: &WorkerSynthesizeRequest) -> Result<ProxyRequest, Response<Body>> {
    let body = serde_json::to_vec(worker)
        .map_err(|e| error_response(&OrchestratorError::BadRequest(e.to_string())))?;
    Ok(ProxyRequest::post("/synthesize", APPLICATION_JSON, body))
}

/// `POST /v1/audio/transcriptions`: multipart upload forwarded unchanged.
pub async fn handle_transcriptions(req: Request<Body>, router: &GatewayRouter) -> Result<Response<Body>, Infallible> {
    settle(transcriptions(req, router).await)
}

async fn transcriptions(req: Request<Body>, router: &GatewayRouter) -> HandlerResult {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some(boundary) = multipart_boundary(&content_type) else {
        return Err(json_error(StatusCode::BAD_REQUEST, "Expected multipart/form-data"));
    };

    let body = read_body(req.into_body()).await?;
    let model = multipart_field(&body, &boundary, "model")
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_STT_MODEL.to_string());
    sys_debug!("[GATEWAY] Transcription upload of {} bytes for {model}", body.len());

    forward(
        router,
        &model,
        ProxyRequest::post("/v1/audio/transcriptions", content_type, body),
    )
    .await
}

/// `POST /v1/transcribe`: base64 audio in JSON, sent to the worker as a form.
pub async fn handle_transcribe(req: Request<Body>, router: &GatewayRouter) -> Result<Response<Body>, Infallible> {
    settle(transcribe(req, router).await)
}

async fn transcribe(req: Request<Body>, router: &GatewayRouter) -> HandlerResult {
    let request: TranscribeRequest = parse_json_body(req.into_body()).await?;
    forward(
        router,
        &request.model,
        ProxyRequest::post("/transcribe", FORM_URLENCODED, request.to_form()),
    )
    .await
}

/// `POST /v1/audio/speech`: audio back, streamed through unless `stream=false`.
pub async fn handle_speech(req: Request<Body>, router: &GatewayRouter) -> Result<Response<Body>, Infallible> {
    settle(speech(req, router).await)
}

async fn speech(req: Request<Body>, router: &GatewayRouter) -> HandlerResult {
    let uri = req.uri().clone();
    let body = read_body(req.into_body()).await?;
    let request: SpeechRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SpeechRequest::from_query(&uri)
    } else {
        parse_json_bytes(&body)?
    };

    if request.input.trim().is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "Field 'input' is required"));
    }

    let call = synthesize_call(&request.to_worker())?;
    let response = forward(router, &request.model, call).await?;
    if request.stream || !response.status().is_success() {
        return Ok(response);
    }

    // Non-streaming: decode the worker's base64 payload into raw audio
    let upstream = |reason: String| {
        error_response(&OrchestratorError::Upstream {
            alias: request.model.clone(),
            reason,
        })
    };
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| upstream(e.to_string()))?;
    let audio: WorkerAudio = serde_json::from_slice(&bytes).map_err(|e| upstream(format!("bad synthesis reply: {e}")))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(audio.audio_base64.as_bytes())
        .map_err(|e| upstream(format!("bad audio payload: {e}")))?;

    Ok(binary_response(&format!("audio/{}", request.response_format), decoded))
}

/// `POST /v1/synthesize`: JSON with base64 audio, passed through.
pub async fn handle_synthesize(req: Request<Body>, router: &GatewayRouter) -> Result<Response<Body>, Infallible> {
    settle(synthesize(req, router).await)
}

async fn synthesize(req: Request<Body>, router: &GatewayRouter) -> HandlerResult {
    let request: SynthesizeRequest = parse_json_body(req.into_body()).await?;
    let call = synthesize_call(&request.to_worker())?;
    forward(router, &request.model, call).await
}
