//! Liveness probe against a worker's `GET /health` endpoint.

use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, StatusCode};

use crate::sys_debug;

/// Default per-probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Answers "is the worker on this port ready to serve?".
pub trait HealthProbe: Send + Sync {
    fn probe(&self, port: u16) -> BoxFuture<'_, bool>;
}

/// Probes `http://{host}:{port}/health`; only a 200 counts as healthy.
pub struct HttpHealthProbe {
    client: Client<HttpConnector>,
    host: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            host: host.into(),
            timeout,
        }
    }

    async fn check(&self, port: u16) -> bool {
        let uri = format!("http://{}:{port}/health", self.host);
        let request = match Request::get(&uri).body(Body::empty()) {
            Ok(req) => req,
            Err(e) => {
                sys_debug!("[HEALTH] Bad probe URI {uri}: {e}");
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status() == StatusCode::OK;
                // Drain so the connection can go back to the pool
                let _ = hyper::body::to_bytes(response.into_body()).await;
                healthy
            }
            Ok(Err(e)) => {
                sys_debug!("[HEALTH] Probe of port {port} failed: {e}");
                false
            }
            Err(_) => {
                sys_debug!("[HEALTH] Probe of port {port} timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self, port: u16) -> BoxFuture<'_, bool> {
        Box::pin(self.check(port))
    }
}
