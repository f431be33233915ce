//! Task Runner
//!
//! Starts one isolated worker per task, relays its messages as
//! [`TaskEvent`]s and guarantees each task ends with exactly one terminal
//! event. At most one non-terminal task exists per server.

pub mod event;
pub mod task;

pub use event::*;
pub use task::*;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult, SerializableError};
use crate::logging::LogLevel;
use crate::ssh::SessionConnector;
use crate::tunnel::HealthReport;
use crate::workers::{self, WorkerContext, WorkerDeps};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Finished tasks kept around for inspection
const MAX_RETAINED_TASKS: usize = 256;

struct TaskEntry {
    info: TaskInfo,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

/// Identity of a running task, carried by its relay
#[derive(Clone)]
struct TaskMeta {
    task_id: TaskId,
    server_id: String,
    kind: TaskKind,
}

struct RunnerInner {
    deps: Arc<WorkerDeps>,
    tasks: DashMap<TaskId, TaskEntry>,
    /// serverId -> its non-terminal task
    active: DashMap<String, TaskId>,
    relays: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones share one runner
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(connector: Arc<dyn SessionConnector>, settings: Arc<AppSettings>) -> Self {
        let capacity = settings.runner.event_capacity.max(16);
        let (events, _) = broadcast::channel(capacity);
        let (health_tx, _) = broadcast::channel(capacity);

        Self {
            inner: Arc::new(RunnerInner {
                deps: Arc::new(WorkerDeps {
                    connector,
                    settings,
                    health_tx,
                }),
                tasks: DashMap::new(),
                active: DashMap::new(),
                relays: Mutex::new(Vec::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.inner.deps.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthReport> {
        self.inner.deps.health_tx.subscribe()
    }

    /// Validate `config` and start its worker.
    ///
    /// Fails without side effects on invalid input, when the server already
    /// has a running task, or after shutdown.
    pub fn run(&self, kind: TaskKind, config: TaskConfig) -> AppResult<TaskId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Cancelled("task runner is shutting down".into()));
        }
        if config.kind() != kind {
            return Err(AppError::Validation(format!(
                "{} task given a {} configuration",
                kind,
                config.kind()
            )));
        }
        config.validate()?;

        let meta = TaskMeta {
            task_id: format!("{}-{}", kind, Uuid::new_v4()),
            server_id: config.server_id().to_string(),
            kind,
        };

        match self.inner.active.entry(meta.server_id.clone()) {
            Entry::Occupied(_) => return Err(AppError::Busy(meta.server_id)),
            Entry::Vacant(slot) => {
                slot.insert(meta.task_id.clone());
            }
        }

        let cancel = self.inner.shutdown.child_token();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let info = TaskInfo {
            id: meta.task_id.clone(),
            kind,
            server_id: meta.server_id.clone(),
            state: TaskState::Queued,
            created_at: Utc::now(),
            finished_at: None,
        };
        tracing::info!("Starting {} task {} for {}", kind, meta.task_id, meta.server_id);
        self.inner.tasks.insert(
            meta.task_id.clone(),
            TaskEntry {
                info,
                cancel: cancel.clone(),
                outcome: outcome_rx,
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext::new(
            meta.task_id.clone(),
            meta.server_id.clone(),
            kind,
            cancel.clone(),
            self.inner.shutdown.clone(),
            tx,
            self.inner.deps.clone(),
        );
        let worker = tokio::spawn(workers::execute(ctx, config));
        if let Some(mut entry) = self.inner.tasks.get_mut(&meta.task_id) {
            if entry.info.state == TaskState::Queued {
                entry.info.state = TaskState::Running;
            }
        }

        let relay = tokio::spawn(self.inner.clone().relay(meta.clone(), rx, worker, cancel, outcome_tx));
        let mut relays = self.inner.relays.lock();
        relays.retain(|h| !h.is_finished());
        relays.push(relay);

        Ok(meta.task_id)
    }

    /// Wait for the task's terminal outcome
    pub async fn wait(&self, task_id: &str) -> TaskOutcome {
        let mut outcome = self
            .inner
            .tasks
            .get(task_id)
            .map(|entry| entry.outcome.clone())
            .ok_or_else(|| AppError::Validation(format!("unknown task {}", task_id)))?;

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(AppError::WorkerCrashed(format!(
                "task {} ended without an outcome",
                task_id
            )))
        })
    }

    /// Request cancellation; the task ends with `Cancelled` after at most
    /// the grace period.
    pub fn cancel(&self, task_id: &str) -> AppResult<()> {
        let entry = self
            .inner
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::Validation(format!("unknown task {}", task_id)))?;
        if !entry.info.state.is_terminal() {
            tracing::info!("Cancelling task {}", task_id);
            entry.cancel.cancel();
        }
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<TaskInfo> {
        self.inner.tasks.get(task_id).map(|entry| entry.info.clone())
    }

    pub fn active_task(&self, server_id: &str) -> Option<TaskId> {
        self.inner.active.get(server_id).map(|id| id.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Cancel everything, including detached tunnels, and wait for every
    /// relay to publish its terminal event.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let relays = std::mem::take(&mut *self.inner.relays.lock());
        tracing::info!("Task runner shutting down ({} relays)", relays.len());
        futures::future::join_all(relays).await;
    }
}

impl RunnerInner {
    fn budget(&self, kind: TaskKind) -> Duration {
        let runner = &self.deps.settings.runner;
        let secs = match kind {
            TaskKind::Test => runner.test_timeout_secs,
            TaskKind::Deploy => runner.deploy_timeout_secs,
            TaskKind::Connect => runner.connect_timeout_secs,
            TaskKind::Chat => runner.chat_timeout_secs,
            TaskKind::Disconnect => runner.disconnect_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    fn emit(&self, meta: &TaskMeta, payload: TaskEventPayload) {
        let _ = self.events.send(TaskEvent {
            task_id: meta.task_id.clone(),
            server_id: meta.server_id.clone(),
            kind: meta.kind,
            timestamp: Utc::now(),
            payload,
        });
    }

    /// Forward worker messages until a terminal one arrives, the worker goes
    /// away, or a stop request outlives its grace period.
    async fn relay(
        self: Arc<Self>,
        meta: TaskMeta,
        mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
        mut worker: JoinHandle<()>,
        cancel: CancellationToken,
        outcome_tx: watch::Sender<Option<TaskOutcome>>,
    ) {
        let budget = self.budget(meta.kind);
        let deadline = Instant::now() + budget;
        let grace = self.deps.settings.runner.cancel_grace();
        let mut stop: Option<(AppError, Instant)> = None;
        let mut terminal: Option<TaskOutcome> = None;

        loop {
            let grace_deadline = stop.as_ref().map(|(_, until)| *until);
            tokio::select! {
                message = rx.recv() => match message {
                    Some(WorkerMessage::Progress { step, current, total }) => {
                        self.emit(&meta, TaskEventPayload::progress(step, current, total));
                    }
                    Some(WorkerMessage::Log { level, message, source }) => {
                        trace_worker_log(&meta, level, &message);
                        self.emit(&meta, TaskEventPayload::Log { level, message, source });
                    }
                    Some(WorkerMessage::Complete(result)) => {
                        terminal = Some(Ok(result));
                        break;
                    }
                    Some(WorkerMessage::Error(e)) => {
                        let e = match &stop {
                            Some((reason, _)) => reason.clone(),
                            None => e,
                        };
                        terminal = Some(Err(e));
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if stop.is_none() => {
                    tracing::warn!("{} task {} exceeded its {:?} budget", meta.kind, meta.task_id, budget);
                    cancel.cancel();
                    stop = Some((
                        AppError::Timeout(format!("{} task exceeded its {:?} budget", meta.kind, budget)),
                        Instant::now() + grace,
                    ));
                }
                _ = cancel.cancelled(), if stop.is_none() => {
                    stop = Some((
                        AppError::Cancelled(format!("{} task was cancelled", meta.kind)),
                        Instant::now() + grace,
                    ));
                }
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or(deadline)), if grace_deadline.is_some() => {
                    match queued_result(&mut rx) {
                        Some(result) => terminal = Some(Ok(result)),
                        None => tracing::warn!("Task {} ignored cancellation; terminating", meta.task_id),
                    }
                    break;
                }
            }
        }

        let outcome = match terminal {
            Some(outcome) => {
                worker.abort();
                outcome
            }
            None => match stop {
                Some((reason, _)) => {
                    worker.abort();
                    Err(reason)
                }
                None => Err(crash_reason((&mut worker).await)),
            },
        };

        match &outcome {
            Ok(result) => {
                tracing::info!("Task {} completed", meta.task_id);
                self.emit(&meta, TaskEventPayload::Complete { result: result.summary() });
            }
            Err(e) => {
                tracing::warn!("Task {} failed: {}", meta.task_id, e);
                self.emit(&meta, TaskEventPayload::Error { error: SerializableError::from(e) });
            }
        }
        self.finish(&meta, outcome, outcome_tx);
    }

    fn finish(&self, meta: &TaskMeta, outcome: TaskOutcome, outcome_tx: watch::Sender<Option<TaskOutcome>>) {
        let state = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        if let Some(mut entry) = self.tasks.get_mut(&meta.task_id) {
            entry.info.state = state;
            entry.info.finished_at = Some(Utc::now());
        }
        self.active.remove_if(&meta.server_id, |_, id| id == &meta.task_id);
        outcome_tx.send_replace(Some(outcome));
        self.prune();
    }

    fn prune(&self) {
        if self.tasks.len() <= MAX_RETAINED_TASKS {
            return;
        }
        let mut finished: Vec<_> = self
            .tasks
            .iter()
            .filter_map(|entry| entry.info.finished_at.map(|at| (at, entry.key().clone())))
            .collect();
        finished.sort();
        let excess = self.tasks.len().saturating_sub(MAX_RETAINED_TASKS);
        for (_, id) in finished.into_iter().take(excess) {
            self.tasks.remove(&id);
        }
    }
}

fn trace_worker_log(meta: &TaskMeta, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("[{}] {}", meta.task_id, message),
        LogLevel::Info => tracing::info!("[{}] {}", meta.task_id, message),
        LogLevel::Warn => tracing::warn!("[{}] {}", meta.task_id, message),
        LogLevel::Error => tracing::error!("[{}] {}", meta.task_id, message),
    }
}

/// A completion that was already queued when the grace period ran out
fn queued_result(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Option<TaskResult> {
    while let Ok(message) = rx.try_recv() {
        if let WorkerMessage::Complete(result) = message {
            return Some(result);
        }
    }
    None
}

/// The worker went away without a terminal message
fn crash_reason(joined: Result<(), JoinError>) -> AppError {
    match joined {
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AppError::WorkerCrashed(format!("worker panicked: {}", message))
        }
        Err(_) => AppError::WorkerCrashed("worker was aborted".to_string()),
        Ok(()) => AppError::WorkerCrashed("worker exited without reporting a result".to_string()),
    }
}
