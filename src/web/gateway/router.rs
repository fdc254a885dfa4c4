//! Gateway router: alias → READY worker → proxied HTTP call.
//!
//! The router never creates or destroys instances itself. It asks the
//! orchestrator for a lease (spawning on a miss), sends the request outside
//! the lock, and hands back a response whose body keeps the lease alive until
//! the client has consumed it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Response};

use crate::web::error::OrchestratorError;
use crate::web::worker::{Orchestrator, WorkerLease};
use crate::{sys_debug, sys_warn};

/// What to send to the worker. The body is passed through untouched.
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Body,
}

impl ProxyRequest {
    pub fn post(path: impl Into<String>, content_type: impl Into<String>, body: impl Into<Body>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            content_type: Some(content_type.into()),
            body: body.into(),
        }
    }
}

/// Response body that holds a [`WorkerLease`] until it has been fully read
/// or dropped, so a streaming response counts as in flight the whole time.
pub struct LeasedBody {
    inner: Body,
    lease: Option<WorkerLease>,
}

impl LeasedBody {
    pub fn new(inner: Body, lease: WorkerLease) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl Stream for LeasedBody {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.lease = None;
        }
        poll
    }
}

pub struct GatewayRouter {
    orchestrator: Arc<Orchestrator>,
    client: Client<HttpConnector>,
    worker_host: String,
    cold_start_timeout: Duration,
    request_timeout: Duration,
}

impl GatewayRouter {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        worker_host: impl Into<String>,
        cold_start_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            client: Client::new(),
            worker_host: worker_host.into(),
            cold_start_timeout,
            request_timeout,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Lease a READY instance of `alias`, cold-starting it if needed but
    /// never waiting longer than the cold-start timeout.
    pub async fn lease(&self, alias: &str) -> Result<WorkerLease, OrchestratorError> {
        self.orchestrator.spec(alias)?;
        if let Some(lease) = self.orchestrator.acquire(alias) {
            return Ok(lease);
        }

        sys_debug!("[ROUTER] {alias}: no READY instance, waiting for cold start");
        match tokio::time::timeout(self.cold_start_timeout, self.orchestrator.lease(alias)).await {
            Err(_) => Err(OrchestratorError::ServiceUnavailable(format!(
                "{alias} did not become ready within {}s",
                self.cold_start_timeout.as_secs()
            ))),
            Ok(lease) => lease,
        }
    }

    /// Proxy `request` to the worker serving `alias`.
    ///
    /// Worker application errors (any status) come back as a normal
    /// response. A connection-level failure is a crash signal: the instance
    /// is dropped at once and the error surfaced, not retried.
    pub async fn route(&self, alias: &str, request: ProxyRequest) -> Result<Response<Body>, OrchestratorError> {
        let lease = self.lease(alias).await?;
        let port = lease.info().port;
        let uri = format!("http://{}:{port}{}", self.worker_host, request.path);

        let mut builder = Request::builder().method(request.method).uri(&uri);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let upstream = builder
            .body(request.body)
            .map_err(|e| OrchestratorError::BadRequest(e.to_string()))?;

        sys_debug!("[ROUTER] {alias} → {uri}");
        match tokio::time::timeout(self.request_timeout, self.client.request(upstream)).await {
            Err(_) => Err(OrchestratorError::RequestTimeout {
                alias: alias.to_string(),
                seconds: self.request_timeout.as_secs(),
            }),
            Ok(Err(e)) if e.is_connect() => {
                sys_warn!("[ROUTER] {alias}: connection to port {port} failed: {e}");
                self.orchestrator.mark_crashed(lease.key(), &e.to_string());
                Err(OrchestratorError::WorkerCrashed {
                    alias: alias.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => Err(OrchestratorError::Upstream {
                alias: alias.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                let body = Body::wrap_stream(LeasedBody::new(body, lease));
                Ok(Response::from_parts(parts, body))
            }
        }
    }
}
