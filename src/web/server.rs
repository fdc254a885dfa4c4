// HTTP servers: the public gateway and the internal worker manager.
//
// Both share one orchestrator. Dispatch follows the usual
// `match (method, path)` table; handlers never see each other's state.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use uuid::Uuid;

use crate::web::gateway::auth::check_api_key;
use crate::web::gateway::GatewayRouter;
use crate::web::response_helpers::{cors_preflight, error_response, json_error, set_request_id};
use crate::web::routes::{audio, health, manager, models, system};
use crate::web::worker::Orchestrator;
use crate::{sys_debug, sys_info};

pub struct GatewayState {
    pub router: GatewayRouter,
    /// `None` when API key auth is disabled
    pub api_key: Option<String>,
}

/// `{alias}` from `{prefix}{alias}`; a single, non-empty path segment.
fn path_alias(path: &str, prefix: &str) -> Option<String> {
    let raw = path.strip_prefix(prefix)?;
    let alias = urlencoding::decode(raw).ok()?.into_owned();
    (!alias.is_empty() && !alias.contains('/')).then_some(alias)
}

fn not_found() -> Response<Body> {
    json_error(StatusCode::NOT_FOUND, "Not Found")
}

pub async fn handle_gateway_request(req: Request<Body>, state: Arc<GatewayState>) -> Result<Response<Body>, Infallible> {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    sys_debug!("[GATEWAY] {request_id} {method} {path}");

    let mut response = dispatch_gateway(req, &state, &method, &path).await?;
    set_request_id(&mut response, &request_id);

    sys_info!(
        "[GATEWAY] {request_id} {method} {path} -> {} ({} ms)",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    Ok(response)
}

async fn dispatch_gateway(
    req: Request<Body>,
    state: &GatewayState,
    method: &Method,
    path: &str,
) -> Result<Response<Body>, Infallible> {
    if method == Method::OPTIONS {
        return Ok(cors_preflight());
    }
    if let Err(e) = check_api_key(state.api_key.as_deref(), path, req.headers()) {
        return Ok(error_response(&e));
    }

    let router = &state.router;
    let orchestrator = router.orchestrator();

    match (method, path) {
        (&Method::GET, "/healthz") => health::handle_healthz().await,
        (&Method::GET, "/v1/models") => models::handle_list_models(orchestrator).await,
        (&Method::GET, "/v1/voices") => models::handle_list_voices().await,
        (&Method::GET, "/v1/system/status") => system::handle_status(orchestrator).await,
        (&Method::POST, "/v1/audio/transcriptions") => audio::handle_transcriptions(req, router).await,
        (&Method::POST, "/v1/transcribe") => audio::handle_transcribe(req, router).await,
        (&Method::POST, "/v1/audio/speech") => audio::handle_speech(req, router).await,
        (&Method::POST, "/v1/synthesize") => audio::handle_synthesize(req, router).await,
        (&Method::POST, _) if path.starts_with("/v1/system/evict/") => {
            match path_alias(path, "/v1/system/evict/") {
                Some(alias) => system::handle_evict(orchestrator, &alias).await,
                None => Ok(not_found()),
            }
        }
        _ => Ok(not_found()),
    }
}

pub async fn handle_manager_request(
    req: Request<Body>,
    orchestrator: Arc<Orchestrator>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    sys_debug!("[MANAGER] {method} {path}");

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => health::handle_manager_health().await,
        (&Method::GET, "/status") => system::handle_status(&orchestrator).await,
        (&Method::POST, "/stop-all") => manager::handle_stop_all(&orchestrator).await,
        (&Method::POST, p) => {
            if let Some(alias) = path_alias(p, "/spawn/") {
                manager::handle_spawn(&orchestrator, &alias).await
            } else if let Some(alias) = path_alias(p, "/touch/") {
                manager::handle_touch(&orchestrator, &alias).await
            } else if let Some(alias) = path_alias(p, "/stop/") {
                manager::handle_stop(&orchestrator, &alias).await
            } else {
                Ok(not_found())
            }
        }
        _ => Ok(not_found()),
    }
}

/// Serve the gateway on `addr` until `shutdown` resolves.
pub async fn serve_gateway<F>(addr: SocketAddr, state: Arc<GatewayState>, shutdown: F) -> hyper::Result<()>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_gateway_request(req, state.clone()))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    sys_info!("[GATEWAY] Listening on http://{addr}");
    server.with_graceful_shutdown(shutdown).await
}

/// Serve the worker manager control surface on `addr` until `shutdown` resolves.
pub async fn serve_manager<F>(addr: SocketAddr, orchestrator: Arc<Orchestrator>, shutdown: F) -> hyper::Result<()>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_manager_request(req, orchestrator.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    sys_info!("[MANAGER] Listening on http://{addr}");
    server.with_graceful_shutdown(shutdown).await
}
