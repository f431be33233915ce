//! Server Coordinator
//!
//! Single writer of server state. Every operation validates its
//! precondition, starts at most one task per server through the
//! [`TaskRunner`], waits for the terminal outcome and applies it to the
//! record before persisting and publishing a status change.

pub mod events;
pub mod record;

pub use events::EngineEvent;
pub use record::*;

use crate::config::ServerStore;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatMessage, ChatReply};
use crate::logging::{sanitize, LogFilter, LogLevel, LogLine, LogManager, LogSubsystem};
use crate::runner::{
    ChatConfig, ConnectConfig, DeployConfig, DisconnectConfig, TaskConfig, TaskEvent,
    TaskEventPayload, TaskId, TaskKind, TaskOutcome, TaskResult, TaskRunner, TestConfig,
};
use crate::tunnel::{HealthReport, TunnelHandle, TunnelInfo};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const SHUTDOWN_TUNNEL_WAIT: Duration = Duration::from_secs(5);

/// Result of a successful connect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConnection {
    pub server: ServerSnapshot,
    pub tunnel: TunnelInfo,
}

struct ServerSlot {
    record: ServerRecord,
    in_flight: Option<(TaskId, TaskKind)>,
    /// Back-reference only; the tunnel context owns the sockets
    tunnel: Option<TunnelHandle>,
    /// Last persisted health result for the current tunnel
    last_healthy: Option<bool>,
    last_event: Option<TaskEvent>,
}

impl ServerSlot {
    fn new(record: ServerRecord) -> Self {
        Self {
            record,
            in_flight: None,
            tunnel: None,
            last_healthy: None,
            last_event: None,
        }
    }

    fn active_tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.as_ref().filter(|t| t.is_active())
    }

    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot::capture(
            &self.record,
            self.in_flight.as_ref().map(|(id, kind)| (id.as_str(), *kind)),
            self.active_tunnel().map(|t| t.local_port()),
        )
    }
}

struct CoordinatorInner {
    runner: TaskRunner,
    store: Arc<dyn ServerStore>,
    logs: Arc<LogManager>,
    servers: Mutex<BTreeMap<String, ServerSlot>>,
    events: broadcast::Sender<EngineEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ServerCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ServerCoordinator {
    /// Load every record and start relaying runner events.
    ///
    /// Tunnels never survive a restart, so persisted `connected` flags are
    /// reset here.
    pub async fn start(
        runner: TaskRunner,
        store: Arc<dyn ServerStore>,
        logs: Arc<LogManager>,
    ) -> AppResult<Self> {
        let mut servers = BTreeMap::new();
        for mut record in store.load_all().await? {
            if record.connected {
                record.connected = false;
                record.disconnected_at = Some(Utc::now());
                store.save(&record).await?;
            }
            servers.insert(record.id.clone(), ServerSlot::new(record));
        }
        tracing::info!("Coordinator loaded {} servers", servers.len());

        let capacity = runner.settings().runner.event_capacity.max(16);
        let (events, _) = broadcast::channel(capacity);
        let task_events = runner.subscribe();
        let health = runner.subscribe_health();

        let inner = Arc::new(CoordinatorInner {
            runner,
            store,
            logs,
            servers: Mutex::new(servers),
            events,
            forwarder: Mutex::new(None),
        });
        let forwarder = tokio::spawn(forward_events(Arc::downgrade(&inner), task_events, health));
        *inner.forwarder.lock() = Some(forwarder);

        Ok(Self { inner })
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_server_status(&self, server_id: &str) -> AppResult<ServerSnapshot> {
        self.inner
            .servers
            .lock()
            .get(server_id)
            .map(ServerSlot::snapshot)
            .ok_or_else(|| AppError::ServerNotFound(server_id.to_string()))
    }

    pub fn get_all_servers(&self) -> Vec<ServerSnapshot> {
        self.inner.servers.lock().values().map(ServerSlot::snapshot).collect()
    }

    pub fn get_tunnel(&self, server_id: &str) -> Option<TunnelHandle> {
        self.inner
            .servers
            .lock()
            .get(server_id)
            .and_then(|slot| slot.tunnel.clone())
    }

    /// Most recent runner event seen for the server
    pub fn last_event(&self, server_id: &str) -> Option<TaskEvent> {
        self.inner
            .servers
            .lock()
            .get(server_id)
            .and_then(|slot| slot.last_event.clone())
    }

    pub fn recent_logs(&self, max_lines: usize, filter: Option<&LogFilter>) -> Vec<LogLine> {
        self.inner.logs.get_recent_logs(max_lines, filter)
    }

    /// SSH reachability plus, when deployed, an LLM health probe.
    ///
    /// A failed probe is `Ok(false)` with the reason kept on the record;
    /// only precondition failures are errors. Never touches `deployed`.
    pub async fn test_connection(&self, server_id: &str) -> AppResult<bool> {
        let success = self
            .execute(
                server_id,
                TaskKind::Test,
                |slot| {
                    Ok(TaskConfig::Test(TestConfig {
                        server_id: slot.record.id.clone(),
                        target: slot.record.ssh_target(),
                        deployed: slot.record.deployed,
                        llm_port: slot.record.llm_port,
                    }))
                },
                |slot, outcome| {
                    let record = &mut slot.record;
                    record.last_check = Some(Utc::now());
                    match outcome {
                        Ok(TaskResult::Tested(report)) if report.success() => {
                            record.error = None;
                            Ok(true)
                        }
                        Ok(TaskResult::Tested(_)) => {
                            record.error = Some(format!(
                                "LLM server on port {} did not answer its health check",
                                record.llm_port
                            ));
                            Ok(false)
                        }
                        Ok(_) => {
                            mark_failed(record, &unexpected(TaskKind::Test));
                            Ok(false)
                        }
                        Err(e) => {
                            mark_failed(record, &e);
                            Ok(false)
                        }
                    }
                },
            )
            .await?;

        self.inner.publish(EngineEvent::ConnectionTested {
            server_id: server_id.to_string(),
            success,
        });
        Ok(success)
    }

    /// Install and start the LLM server. `deployed` only changes on success.
    pub async fn deploy_server(&self, server_id: &str) -> AppResult<ServerSnapshot> {
        let deploy = self.inner.runner.settings().deploy.clone();
        self.execute(
            server_id,
            TaskKind::Deploy,
            move |slot| {
                Ok(TaskConfig::Deploy(DeployConfig {
                    server_id: slot.record.id.clone(),
                    target: slot.record.ssh_target(),
                    deploy_path: slot.record.deploy_path.clone(),
                    llm_port: slot.record.llm_port,
                    listen_host: deploy.listen_host,
                    models: deploy.models,
                    script_path: deploy.script_path,
                }))
            },
            |slot, outcome| match outcome {
                Ok(TaskResult::Deployed(report)) => {
                    for warning in &report.warnings {
                        tracing::warn!("Deploy warning for {}: {}", slot.record.id, warning);
                    }
                    slot.record.deployed = true;
                    slot.record.error = None;
                    slot.record.disconnected_at = None;
                    slot.record.last_check = Some(Utc::now());
                    Ok(slot.snapshot())
                }
                Ok(_) => fail(slot, unexpected(TaskKind::Deploy)),
                Err(e) => fail(slot, e),
            },
        )
        .await
    }

    /// Establish a tunnel. Requires `deployed`; returns the existing tunnel
    /// when one is already active.
    pub async fn connect_server(&self, server_id: &str) -> AppResult<ServerConnection> {
        let (existing, reserved_ports) = {
            let servers = self.inner.servers.lock();
            let slot = servers
                .get(server_id)
                .ok_or_else(|| AppError::ServerNotFound(server_id.to_string()))?;
            let existing = match slot.active_tunnel() {
                Some(tunnel) if slot.in_flight.is_none() && slot.record.connected => Some(ServerConnection {
                    server: slot.snapshot(),
                    tunnel: tunnel.info(),
                }),
                _ => None,
            };
            let reserved: Vec<u16> = servers
                .iter()
                .filter(|(id, _)| id.as_str() != server_id)
                .filter_map(|(_, other)| other.active_tunnel().map(|t| t.local_port()))
                .collect();
            (existing, reserved)
        };
        if let Some(connection) = existing {
            return Ok(connection);
        }

        self.execute(
            server_id,
            TaskKind::Connect,
            move |slot| {
                if !slot.record.deployed {
                    return Err(AppError::Validation(format!(
                        "server {} must be deployed before connecting",
                        slot.record.id
                    )));
                }
                Ok(TaskConfig::Connect(ConnectConfig {
                    server_id: slot.record.id.clone(),
                    target: slot.record.ssh_target(),
                    remote_port: slot.record.llm_port,
                    local_port: None,
                    reserved_ports,
                }))
            },
            |slot, outcome| match outcome {
                Ok(TaskResult::Connected(report)) => {
                    if let Some(stale) = slot.tunnel.replace(report.tunnel.clone()) {
                        stale.request_close();
                    }
                    slot.last_healthy = Some(report.healthy);
                    slot.record.connected = true;
                    slot.record.disconnected_at = None;
                    slot.record.error = None;
                    slot.record.last_check = Some(Utc::now());
                    Ok(ServerConnection {
                        server: slot.snapshot(),
                        tunnel: report.tunnel.info(),
                    })
                }
                Ok(_) => fail(slot, unexpected(TaskKind::Connect)),
                Err(e) => {
                    slot.record.connected = false;
                    fail(slot, e)
                }
            },
        )
        .await
    }

    /// Tear down the tunnel. A server with nothing to tear down and no task
    /// in flight is left as is.
    pub async fn disconnect_server(&self, server_id: &str) -> AppResult<ServerSnapshot> {
        {
            let servers = self.inner.servers.lock();
            let slot = servers
                .get(server_id)
                .ok_or_else(|| AppError::ServerNotFound(server_id.to_string()))?;
            if slot.in_flight.is_none() && !slot.record.connected && slot.tunnel.is_none() {
                return Ok(slot.snapshot());
            }
        }

        self.execute(
            server_id,
            TaskKind::Disconnect,
            |slot| {
                Ok(TaskConfig::Disconnect(DisconnectConfig {
                    server_id: slot.record.id.clone(),
                    tunnel: slot.tunnel.clone(),
                }))
            },
            |slot, outcome| {
                if let Some(tunnel) = slot.tunnel.take() {
                    tunnel.request_close();
                }
                slot.last_healthy = None;
                slot.record.connected = false;
                slot.record.disconnected_at = Some(Utc::now());
                match outcome {
                    Ok(_) => {
                        slot.record.error = None;
                        Ok(slot.snapshot())
                    }
                    Err(e) => fail(slot, e),
                }
            },
        )
        .await
    }

    /// Test, then deploy if needed, then connect if needed. Stops at the
    /// first failure.
    pub async fn ensure_ready(&self, server_id: &str) -> AppResult<ServerSnapshot> {
        if !self.test_connection(server_id).await? {
            let snapshot = self.get_server_status(server_id)?;
            return Err(AppError::Connect(snapshot.error.unwrap_or_else(|| {
                format!("connection test for {} failed", server_id)
            })));
        }

        if !self.get_server_status(server_id)?.deployed {
            self.deploy_server(server_id).await?;
        }

        let snapshot = self.get_server_status(server_id)?;
        if !(snapshot.connected && snapshot.local_port.is_some()) {
            self.connect_server(server_id).await?;
        }

        let snapshot = self.get_server_status(server_id)?;
        if let Some(local_port) = snapshot.local_port {
            self.inner.publish(EngineEvent::ServerReady {
                server_id: server_id.to_string(),
                local_port,
            });
        }
        Ok(snapshot)
    }

    pub async fn chat(&self, server_id: &str, messages: Vec<ChatMessage>) -> AppResult<ChatReply> {
        self.chat_with_model(server_id, messages, None).await
    }

    /// Chat through the active tunnel. Fails with `NotConnected` locally
    /// when there is none.
    pub async fn chat_with_model(
        &self,
        server_id: &str,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> AppResult<ChatReply> {
        self.execute(
            server_id,
            TaskKind::Chat,
            move |slot| {
                let local_port = match (slot.record.connected, slot.active_tunnel()) {
                    (true, Some(tunnel)) => tunnel.local_port(),
                    _ => return Err(AppError::NotConnected(slot.record.id.clone())),
                };
                Ok(TaskConfig::Chat(ChatConfig {
                    server_id: slot.record.id.clone(),
                    local_port,
                    model,
                    messages,
                    max_tokens: None,
                }))
            },
            |slot, outcome| match outcome {
                Ok(TaskResult::Chat(reply)) => {
                    slot.record.error = None;
                    Ok(reply)
                }
                Ok(_) => fail(slot, unexpected(TaskKind::Chat)),
                Err(e) => fail(slot, e),
            },
        )
        .await
    }

    /// Close every tunnel, stop the runner and mark servers disconnected.
    pub async fn shutdown(&self) {
        let tunnels: Vec<TunnelHandle> = self
            .inner
            .servers
            .lock()
            .values_mut()
            .filter_map(|slot| slot.tunnel.take())
            .collect();
        for tunnel in &tunnels {
            tunnel.request_close();
        }

        self.inner.runner.shutdown().await;

        for tunnel in &tunnels {
            if !tunnel.wait_closed(SHUTDOWN_TUNNEL_WAIT).await {
                tracing::warn!("Tunnel for {} did not close in time", tunnel.server_id());
            }
        }

        let records: Vec<ServerRecord> = self
            .inner
            .servers
            .lock()
            .values_mut()
            .filter(|slot| slot.record.connected)
            .map(|slot| {
                slot.record.connected = false;
                slot.record.disconnected_at = Some(Utc::now());
                slot.record.clone()
            })
            .collect();
        for record in &records {
            self.inner.persist(record).await;
        }

        if let Some(forwarder) = self.inner.forwarder.lock().take() {
            forwarder.abort();
        }
        tracing::info!("Coordinator stopped");
    }

    /// Start a task under the server's lock, then apply its outcome.
    ///
    /// The wait runs on its own task so that dropping the caller's future
    /// never leaves a server marked in flight.
    async fn execute<T, B, F>(&self, server_id: &str, kind: TaskKind, build: B, apply: F) -> AppResult<T>
    where
        T: Send + 'static,
        B: FnOnce(&ServerSlot) -> AppResult<TaskConfig>,
        F: FnOnce(&mut ServerSlot, TaskOutcome) -> AppResult<T> + Send + 'static,
    {
        let task_id = self.inner.begin(server_id, kind, build)?;
        let inner = self.inner.clone();
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            let outcome = inner.runner.wait(&task_id).await;
            inner.complete(&server_id, &task_id, outcome, apply).await
        })
        .await
        .map_err(|e| AppError::WorkerCrashed(format!("coordinator task failed: {}", e)))?
    }
}

impl CoordinatorInner {
    fn begin<B>(&self, server_id: &str, kind: TaskKind, build: B) -> AppResult<TaskId>
    where
        B: FnOnce(&ServerSlot) -> AppResult<TaskConfig>,
    {
        let (task_id, snapshot) = {
            let mut servers = self.servers.lock();
            let slot = servers
                .get_mut(server_id)
                .ok_or_else(|| AppError::ServerNotFound(server_id.to_string()))?;
            if slot.in_flight.is_some() {
                return Err(AppError::Busy(server_id.to_string()));
            }
            let config = build(slot)?;
            let task_id = self.runner.run(kind, config)?;
            slot.in_flight = Some((task_id.clone(), kind));
            (task_id, slot.snapshot())
        };
        self.publish_status(snapshot);
        Ok(task_id)
    }

    async fn complete<T, F>(&self, server_id: &str, task_id: &str, outcome: TaskOutcome, apply: F) -> AppResult<T>
    where
        F: FnOnce(&mut ServerSlot, TaskOutcome) -> AppResult<T>,
    {
        let (result, record, snapshot) = {
            let mut servers = self.servers.lock();
            let slot = servers
                .get_mut(server_id)
                .ok_or_else(|| AppError::ServerNotFound(server_id.to_string()))?;
            if slot.in_flight.as_ref().is_some_and(|(id, _)| id == task_id) {
                slot.in_flight = None;
            }
            let result = apply(slot, outcome);
            debug_assert!(slot.record.is_consistent(), "connected server must be deployed");
            (result, slot.record.clone(), slot.snapshot())
        };

        self.persist(&record).await;
        self.publish_status(snapshot);
        result
    }

    async fn persist(&self, record: &ServerRecord) {
        if let Err(e) = self.store.save(record).await {
            tracing::error!("Failed to persist server {}: {}", record.id, e);
            self.logs.log(
                LogLine::new(LogLevel::Error, LogSubsystem::Config, format!("Failed to persist server: {}", e))
                    .with_server(record.id.clone()),
            );
        }
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn publish_status(&self, snapshot: ServerSnapshot) {
        let level = if snapshot.error.is_some() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        let mut line = LogLine::new(level, LogSubsystem::Coordinator, format!("status: {}", snapshot.status))
            .with_server(snapshot.id.clone());
        if let Some(error) = &snapshot.error {
            line = line.with_details(json!({ "error": error }));
        }
        self.logs.log(line);

        self.publish(EngineEvent::StatusChange {
            server_id: snapshot.id.clone(),
            server: snapshot,
        });
    }

    fn on_task_event(&self, event: TaskEvent) {
        if let Some(slot) = self.servers.lock().get_mut(&event.server_id) {
            slot.last_event = Some(event.clone());
        }

        let subsystem = subsystem_for(event.kind);
        match &event.payload {
            TaskEventPayload::Progress {
                step,
                current,
                total,
                percentage,
            } => {
                self.publish(EngineEvent::Progress {
                    server_id: event.server_id.clone(),
                    task_id: event.task_id.clone(),
                    kind: event.kind,
                    step: step.clone(),
                    current: *current,
                    total: *total,
                    percentage: *percentage,
                });
                if event.kind == TaskKind::Deploy {
                    self.publish(EngineEvent::DeploymentProgress {
                        server_id: event.server_id.clone(),
                        task_id: event.task_id.clone(),
                        percentage: *percentage,
                        message: step.clone(),
                    });
                }
            }
            TaskEventPayload::Log {
                level,
                message,
                source,
            } => {
                self.logs.log(
                    LogLine::new(*level, subsystem, message.clone())
                        .with_server(event.server_id.clone())
                        .with_task(event.task_id.clone())
                        .with_details(json!({ "source": source })),
                );
                self.publish(EngineEvent::Log {
                    server_id: event.server_id.clone(),
                    task_id: event.task_id.clone(),
                    level: *level,
                    message: message.clone(),
                    source: source.clone(),
                });
            }
            TaskEventPayload::Complete { .. } => {
                self.logs.log(
                    LogLine::new(LogLevel::Info, subsystem, format!("{} task completed", event.kind))
                        .with_server(event.server_id.clone())
                        .with_task(event.task_id.clone()),
                );
            }
            TaskEventPayload::Error { error } => {
                self.logs.log(
                    LogLine::new(LogLevel::Error, subsystem, format!("{} task failed: {}", event.kind, error.message))
                        .with_server(event.server_id.clone())
                        .with_task(event.task_id.clone())
                        .with_details(json!({ "code": error.code, "details": error.details })),
                );
            }
        }
    }

    /// `last_check` moves on every sample; the record is written only when
    /// the health result flips.
    async fn on_health(&self, report: HealthReport) {
        let changed = {
            let mut servers = self.servers.lock();
            match servers.get_mut(&report.server_id) {
                Some(slot)
                    if slot.record.connected
                        && slot.active_tunnel().map(|t| t.local_port()) == Some(report.local_port) =>
                {
                    slot.record.last_check = Some(report.timestamp);
                    let flipped = slot.last_healthy != Some(report.healthy);
                    slot.last_healthy = Some(report.healthy);
                    Some(flipped.then(|| slot.record.clone()))
                }
                _ => None,
            }
        };
        let Some(changed) = changed else {
            return;
        };
        if let Some(record) = changed {
            self.persist(&record).await;
        }
        self.publish(EngineEvent::Health {
            server_id: report.server_id,
            local_port: report.local_port,
            healthy: report.healthy,
        });
    }
}

async fn forward_events(
    inner: Weak<CoordinatorInner>,
    mut tasks: broadcast::Receiver<TaskEvent>,
    mut health: broadcast::Receiver<HealthReport>,
) {
    loop {
        tokio::select! {
            event = tasks.recv() => match event {
                Ok(event) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_task_event(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Coordinator skipped {} task events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            report = health.recv() => match report {
                Ok(report) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_health(report).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Coordinator skipped {} health reports", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn subsystem_for(kind: TaskKind) -> LogSubsystem {
    match kind {
        TaskKind::Test => LogSubsystem::Ssh,
        TaskKind::Deploy => LogSubsystem::Deploy,
        TaskKind::Connect | TaskKind::Disconnect => LogSubsystem::Tunnel,
        TaskKind::Chat => LogSubsystem::Chat,
    }
}

fn mark_failed(record: &mut ServerRecord, error: &AppError) {
    record.error = Some(sanitize(&error.to_string()));
}

fn fail<T>(slot: &mut ServerSlot, error: AppError) -> AppResult<T> {
    mark_failed(&mut slot.record, &error);
    Err(error)
}

fn unexpected(kind: TaskKind) -> AppError {
    AppError::WorkerCrashed(format!("{} task returned an unexpected result", kind))
}
