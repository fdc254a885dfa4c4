// HTTP response helper functions shared by the gateway and manager handlers

use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::http::response::Builder;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use crate::web::error::OrchestratorError;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization, x-api-key";

/// Seconds a client should back off after a retryable failure
const RETRY_AFTER_SECONDS: &str = "5";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn with_cors(builder: Builder) -> Builder {
    builder
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

fn finish(builder: Builder, body: Body) -> Response<Body> {
    // Only fails on invalid header values, and ours are all static
    builder.body(body).unwrap_or_else(|_| {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    json_raw(status, json)
}

/// Build a JSON error response
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build a raw JSON string response
pub fn json_raw(status: StatusCode, json: String) -> Response<Body> {
    let builder = with_cors(Response::builder().status(status)).header("content-type", "application/json");
    finish(builder, Body::from(json))
}

/// Binary payload (decoded audio) with its media type
pub fn binary_response(content_type: &str, bytes: Vec<u8>) -> Response<Body> {
    let builder = with_cors(Response::builder().status(StatusCode::OK)).header("content-type", content_type);
    finish(builder, Body::from(bytes))
}

/// Build an empty response with CORS headers
pub fn empty_response(status: StatusCode) -> Response<Body> {
    finish(with_cors(Response::builder().status(status)), Body::empty())
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    empty_response(StatusCode::OK)
}

/// Map an orchestration failure to its HTTP response. Busy/timeout errors
/// carry `Retry-After`.
pub fn error_response(error: &OrchestratorError) -> Response<Body> {
    let status = error.status_code();
    let mut response = json_response(
        status,
        &serde_json::json!({
            "error": error.to_string(),
            "retryable": error.is_retryable(),
        }),
    );
    if error.is_retryable() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECONDS));
    }
    response
}

/// Add CORS headers to a response built elsewhere (proxied worker replies).
pub fn add_cors(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static(CORS_ORIGIN));
    headers.insert("access-control-allow-methods", HeaderValue::from_static(CORS_METHODS));
    headers.insert("access-control-allow-headers", HeaderValue::from_static(CORS_HEADERS));
}

pub fn set_request_id(response: &mut Response<Body>, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
