#![allow(dead_code)]

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use llmdock::config::{AppSettings, MemoryServerStore};
use llmdock::coordinator::{ServerCoordinator, ServerRecord};
use llmdock::error::{AppError, AppResult};
use llmdock::logging::LogManager;
use llmdock::runner::TaskRunner;
use llmdock::ssh::{BoxedStream, ExecOutput, RemoteSession, SessionConnector, SshTarget};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

pub type ExecFn = Arc<dyn Fn(&str) -> ExecOutput + Send + Sync>;

/// Scriptable stand-in for the SSH layer
pub struct StubConnector {
    exec: Mutex<ExecFn>,
    handshake_delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<(watch::Sender<bool>, watch::Receiver<bool>)>>,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// (remote path, uploaded content)
    pub transfers: Arc<Mutex<Vec<(String, String)>>>,
}

impl StubConnector {
    pub fn new(exec: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            exec: Mutex::new(Arc::new(exec)),
            handshake_delay: Mutex::new(None),
            gate: Mutex::new(None),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            transfers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A host where every step of test and deploy succeeds
    pub fn healthy_host() -> Arc<Self> {
        Self::new(healthy_exec())
    }

    pub fn set_exec(&self, exec: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) {
        *self.exec.lock() = Arc::new(exec);
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock() = Some(delay);
    }

    /// Hold every connect until [`StubConnector::open_gate`]
    pub fn close_gate(&self) {
        *self.gate.lock() = Some(watch::channel(false));
    }

    pub fn open_gate(&self) {
        if let Some((tx, _)) = self.gate.lock().take() {
            let _ = tx.send(true);
        }
    }
}

#[async_trait]
impl SessionConnector for StubConnector {
    async fn connect(&self, target: &SshTarget) -> AppResult<Arc<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.handshake_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let gate = self.gate.lock().as_ref().map(|(_, rx)| rx.clone());
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        if target.password.as_deref() == Some("wrong") {
            return Err(AppError::Auth("password rejected".into()));
        }
        Ok(Arc::new(StubSession {
            exec: self.exec.lock().clone(),
            closes: self.closes.clone(),
            transfers: self.transfers.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct StubSession {
    exec: ExecFn,
    closes: Arc<AtomicUsize>,
    transfers: Arc<Mutex<Vec<(String, String)>>>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for StubSession {
    fn host_fingerprint(&self) -> Option<String> {
        Some("SHA256:stub".to_string())
    }

    async fn exec(&self, command: &str) -> AppResult<ExecOutput> {
        Ok((self.exec)(command))
    }

    async fn transfer(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        let content = std::fs::read_to_string(local_path)?;
        self.transfers.lock().push((remote_path.to_string(), content));
        Ok(())
    }

    /// The "remote" host is this machine
    async fn open_forward(&self, remote_host: &str, remote_port: u16) -> AppResult<BoxedStream> {
        let stream = TcpStream::connect((remote_host, remote_port))
            .await
            .map_err(|e| AppError::Connect(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Answers the commands issued by the test and deploy workers
pub fn healthy_exec() -> impl Fn(&str) -> ExecOutput + Send + Sync + 'static {
    let started = Arc::new(AtomicBool::new(false));
    move |command: &str| {
        if command.starts_with("uname") {
            ExecOutput::ok("Linux 6.1.0-stub\n")
        } else if command.starts_with("curl") {
            ExecOutput::ok("200")
        } else if command.starts_with("python3 --version") {
            ExecOutput::ok("Python 3.11.2\n")
        } else if command.starts_with("python3 -m pip") {
            ExecOutput::ok("pip 23.0\n")
        } else if command.starts_with("df ") {
            ExecOutput::ok("/dev/sda1 102400000 51200000 51200000 50% /opt\n")
        } else if command.starts_with("cd ") {
            started.store(true, Ordering::SeqCst);
            ExecOutput::ok(concat!(
                "{\"type\":\"progress\",\"progress\":50,\"message\":\"installing\"}\n",
                "{\"type\":\"complete\",\"success\":true,\"message\":\"done\"}\n"
            ))
        } else if command.contains("ss -ltn") {
            if started.load(Ordering::SeqCst) {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(1, "")
            }
        } else {
            ExecOutput::ok("")
        }
    }
}

/// OpenAI-compatible server on an ephemeral port
pub async fn spawn_llm_server() -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/models",
            get(|| async { Json(json!({ "data": [{ "id": "stub-model" }] })) }),
        )
        .route(
            "/api/tags",
            get(|| async { Json(json!({ "models": [{ "name": "stub-model" }] })) }),
        )
        .route("/v1/chat/completions", post(chat_completion));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn chat_completion(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "id": "chatcmpl-stub",
        "model": body["model"],
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "hello from stub" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 3, "completion_tokens": 3, "total_tokens": 6 }
    }))
}

pub fn fast_settings() -> AppSettings {
    let mut settings = AppSettings::default();
    settings.ssh.handshake_timeout_ms = 2_000;
    settings.ssh.command_timeout_secs = 5;
    settings.tunnel.port_offset = 1;
    settings.tunnel.settle_delay_ms = 10;
    settings.tunnel.health_interval_ms = 50;
    settings.tunnel.health_timeout_ms = 1_000;
    settings.runner.cancel_grace_ms = 200;
    settings.runner.disconnect_timeout_secs = 5;
    settings.llm.request_timeout_secs = 5;
    settings
}

pub fn record(id: &str, llm_port: u16) -> ServerRecord {
    let mut record = ServerRecord::new(id, "10.0.0.5", "llm").with_password("secret");
    record.llm_port = llm_port;
    record
}

pub struct Harness {
    pub connector: Arc<StubConnector>,
    pub store: Arc<MemoryServerStore>,
    pub coordinator: ServerCoordinator,
    pub llm: SocketAddr,
}

impl Harness {
    pub async fn start(records: Vec<ServerRecord>) -> Self {
        Self::with_settings(records, fast_settings()).await
    }

    pub async fn with_settings(records: Vec<ServerRecord>, settings: AppSettings) -> Self {
        let llm = spawn_llm_server().await;
        let records = records
            .into_iter()
            .map(|mut r| {
                if r.llm_port == 0 {
                    r.llm_port = llm.port();
                }
                r
            })
            .collect();
        let connector = StubConnector::healthy_host();
        let store = Arc::new(MemoryServerStore::new(records));
        let runner = TaskRunner::new(connector.clone(), Arc::new(settings));
        let coordinator = ServerCoordinator::start(runner, store.clone(), LogManager::in_memory())
            .await
            .unwrap();
        Self {
            connector,
            store,
            coordinator,
            llm,
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
