//! Test doubles for the orchestrator: fake processes, a scripted health
//! probe, and an in-process HTTP worker.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use futures_util::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::Notify;
use voice_insight_config::{gb_to_bytes, LaunchTemplate, ModelType, WorkerSpec};

use super::health::HealthProbe;
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::process_manager::{ProcessHandle, ProcessLauncher};

pub const GB: u64 = voice_insight_config::BYTES_PER_GB;

/// Raw WAV header bytes returned by the fake TTS worker.
pub const FAKE_AUDIO: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt ";

pub fn test_spec(alias: &str, port: u16, memory_gb: f64) -> WorkerSpec {
    let model_type = if alias.starts_with("stt") {
        ModelType::Stt
    } else {
        ModelType::Tts
    };
    WorkerSpec {
        alias: alias.to_string(),
        model_type,
        model_path: format!("models/{alias}"),
        launch: LaunchTemplate {
            program: "fake-worker".to_string(),
            args: vec![alias.to_string()],
        },
        port,
        memory_bytes: gb_to_bytes(memory_gb),
        idle_timeout: Duration::from_secs(300),
    }
}

pub fn orchestrator_with(
    specs: Vec<WorkerSpec>,
    budget_gb: f64,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
) -> Arc<Orchestrator> {
    Orchestrator::new(
        specs,
        gb_to_bytes(budget_gb),
        launcher,
        probe,
        OrchestratorSettings::default(),
    )
}

/// An unused loopback port.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

// ─── Fake process ─────────────────────────────────────────────────────

#[derive(Default)]
struct ProcessState {
    exited: Mutex<Option<String>>,
    terminated: AtomicBool,
    killed: AtomicBool,
    exit: Notify,
}

/// Observer/controller for a [`FakeHandle`], kept by the test.
#[derive(Clone, Default)]
pub struct FakeProcess {
    state: Arc<ProcessState>,
}

impl FakeProcess {
    pub fn was_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.state.exited.lock().unwrap().is_some()
    }

    /// Make the process exit on its own.
    pub fn exit(&self, status: &str) {
        let mut exited = self.state.exited.lock().unwrap();
        if exited.is_none() {
            *exited = Some(status.to_string());
        }
        drop(exited);
        self.state.exit.notify_waiters();
    }

    /// Resolve once the process has exited.
    pub async fn exited(&self) {
        loop {
            let notified = self.state.exit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_exited() {
                return;
            }
            notified.await;
        }
    }
}

pub struct FakeHandle {
    process: FakeProcess,
    ignore_terminate: bool,
}

impl FakeHandle {
    pub fn new() -> (Self, FakeProcess) {
        let process = FakeProcess::default();
        let handle = Self {
            process: process.clone(),
            ignore_terminate: false,
        };
        (handle, process)
    }

    /// A process that only dies to kill.
    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn try_exit_status(&mut self) -> Option<String> {
        self.process.state.exited.lock().unwrap().clone()
    }

    fn terminate(&mut self) {
        self.process.state.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.process.exit("terminated");
        }
    }

    fn kill(&mut self) {
        self.process.state.killed.store(true, Ordering::SeqCst);
        self.process.exit("killed");
    }

    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.process.exited())
    }
}

// ─── Fake launcher ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<HashMap<String, usize>>,
    processes: Mutex<HashMap<String, FakeProcess>>,
    fail_spawn: Mutex<HashSet<String>>,
    exit_immediately: Mutex<HashSet<String>>,
    hang_on_terminate: Mutex<HashSet<String>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches(&self, alias: &str) -> usize {
        self.launches.lock().unwrap().get(alias).copied().unwrap_or(0)
    }

    /// The most recently launched process for `alias`.
    pub fn process(&self, alias: &str) -> FakeProcess {
        self.processes.lock().unwrap().get(alias).cloned().unwrap()
    }

    pub fn fail_spawn(&self, alias: &str) {
        self.fail_spawn.lock().unwrap().insert(alias.to_string());
    }

    pub fn exit_immediately(&self, alias: &str) {
        self.exit_immediately.lock().unwrap().insert(alias.to_string());
    }

    pub fn hang_on_terminate(&self, alias: &str) {
        self.hang_on_terminate.lock().unwrap().insert(alias.to_string());
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>, String> {
        *self
            .launches
            .lock()
            .unwrap()
            .entry(spec.alias.clone())
            .or_default() += 1;

        if self.fail_spawn.lock().unwrap().contains(&spec.alias) {
            return Err("No such file or directory (os error 2)".to_string());
        }

        let (mut handle, process) = FakeHandle::new();
        if self.hang_on_terminate.lock().unwrap().contains(&spec.alias) {
            handle = handle.ignoring_terminate();
        }
        if self.exit_immediately.lock().unwrap().contains(&spec.alias) {
            process.exit("exit status: 1");
        }
        self.processes
            .lock()
            .unwrap()
            .insert(spec.alias.clone(), process);
        Ok(Box::new(handle))
    }
}

// ─── Fake probe ───────────────────────────────────────────────────────

/// Health probe answering from a per-port script. Ports default to healthy.
#[derive(Default)]
pub struct FakeProbe {
    unhealthy: Mutex<HashSet<u16>>,
    fail_first: Mutex<HashMap<u16, usize>>,
    probes: AtomicUsize,
}

impl FakeProbe {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_healthy(&self, port: u16, healthy: bool) {
        let mut unhealthy = self.unhealthy.lock().unwrap();
        if healthy {
            unhealthy.remove(&port);
        } else {
            unhealthy.insert(port);
        }
    }

    /// Fail the next `count` probes of `port`.
    pub fn fail_first(&self, port: u16, count: usize) {
        self.fail_first.lock().unwrap().insert(port, count);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn answer(&self, port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(remaining) = self.fail_first.lock().unwrap().get_mut(&port) {
            if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
        }
        !self.unhealthy.lock().unwrap().contains(&port)
    }
}

impl HealthProbe for FakeProbe {
    fn probe(&self, port: u16) -> BoxFuture<'_, bool> {
        let healthy = self.answer(port);
        Box::pin(async move { healthy })
    }
}

// ─── In-process HTTP workers ──────────────────────────────────────────

/// Keeps a test server alive; the server stops when this is dropped.
pub struct ServerGuard {
    process: FakeProcess,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.process.exit("dropped");
    }
}

fn bind(port: u16) -> TcpListener {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();
    listener.set_nonblocking(true).unwrap();
    listener
}

/// Serve `GET /health` with a fixed status on `port`.
pub fn serve_health(port: u16, status: StatusCode) -> ServerGuard {
    let process = FakeProcess::default();
    let listener = bind(port);
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| async move {
            Ok::<_, Infallible>(Response::builder().status(status).body(Body::empty()).unwrap())
        }))
    });
    let server = Server::from_tcp(listener)
        .unwrap()
        .serve(make_svc)
        .with_graceful_shutdown({
            let process = process.clone();
            async move { process.exited().await }
        });
    tokio::spawn(server);
    ServerGuard { process }
}

/// Minimal worker: `/health`, `/synthesize`, `/transcribe`, and
/// `/v1/audio/transcriptions`.
async fn fake_worker(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();

    let json = |status: StatusCode, value: serde_json::Value| {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    };

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") => json(StatusCode::OK, serde_json::json!({"status": "healthy"})),
        (Method::POST, "/synthesize") => {
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let text = request["text"].as_str().unwrap_or_default();
            if text.is_empty() {
                json(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    serde_json::json!({"detail": "text is required"}),
                )
            } else if request["stream"].as_bool().unwrap_or(false) {
                Response::builder()
                    .header("content-type", "audio/wav")
                    .body(Body::from(FAKE_AUDIO))
                    .unwrap()
            } else {
                json(
                    StatusCode::OK,
                    serde_json::json!({
                        "audio_base64": base64::engine::general_purpose::STANDARD.encode(FAKE_AUDIO),
                        "sample_rate": 24000,
                        "format": request["format"].as_str().unwrap_or("wav"),
                        "voice": request["voice"],
                    }),
                )
            }
        }
        (Method::POST, "/transcribe") => json(
            StatusCode::OK,
            serde_json::json!({
                "text": "hello world",
                "content_type": content_type,
                "form": String::from_utf8_lossy(&body),
            }),
        ),
        (Method::POST, "/v1/audio/transcriptions") => json(
            StatusCode::OK,
            serde_json::json!({
                "text": "hello world",
                "content_type": content_type,
                "bytes": body.len(),
            }),
        ),
        _ => json(StatusCode::NOT_FOUND, serde_json::json!({"detail": "not found"})),
    };
    Ok(response)
}

/// Launches [`fake_worker`] servers in-process on each spec's port. The
/// returned handle stops the server on terminate/kill.
#[derive(Default)]
pub struct HttpWorkerLauncher {
    processes: Mutex<HashMap<String, FakeProcess>>,
    launches: AtomicUsize,
}

impl HttpWorkerLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Take the worker for `alias` down without telling the orchestrator.
    pub fn crash(&self, alias: &str) {
        if let Some(process) = self.processes.lock().unwrap().get(alias) {
            process.exit("crashed");
        }
    }
}

impl ProcessLauncher for HttpWorkerLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>, String> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], spec.port)))
            .map_err(|e| e.to_string())?;
        listener.set_nonblocking(true).map_err(|e| e.to_string())?;

        let (handle, process) = FakeHandle::new();
        let make_svc =
            make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(fake_worker)) });
        let server = Server::from_tcp(listener)
            .map_err(|e| e.to_string())?
            .serve(make_svc)
            .with_graceful_shutdown({
                let process = process.clone();
                async move { process.exited().await }
            });
        tokio::spawn(server);

        self.processes
            .lock()
            .unwrap()
            .insert(spec.alias.clone(), process);
        Ok(Box::new(handle))
    }
}
