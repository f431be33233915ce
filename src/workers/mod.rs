//! Task workers
//!
//! Each worker runs in its own tokio task and talks to the runner only
//! through [`WorkerContext`]: progress and log messages out, exactly one
//! `Complete` or `Error` at the end.

pub mod chat;
pub mod connect;
pub mod deploy;
pub mod disconnect;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::logging::LogLevel;
use crate::runner::{TaskConfig, TaskId, TaskKind, TaskOutcome, WorkerMessage};
use crate::ssh::{ExecOutput, RemoteSession, SessionConnector, SshTarget};
use crate::tunnel::HealthReport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Shared by every worker the runner starts
pub struct WorkerDeps {
    pub connector: Arc<dyn SessionConnector>,
    pub settings: Arc<AppSettings>,
    pub health_tx: broadcast::Sender<HealthReport>,
}

pub struct WorkerContext {
    pub task_id: TaskId,
    pub server_id: String,
    pub kind: TaskKind,
    /// Fires on cancel or budget expiry
    pub cancel: CancellationToken,
    /// Runner-wide; parent of long-lived tunnel contexts
    pub shutdown: CancellationToken,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    deps: Arc<WorkerDeps>,
}

impl WorkerContext {
    pub(crate) fn new(
        task_id: TaskId,
        server_id: String,
        kind: TaskKind,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        tx: mpsc::UnboundedSender<WorkerMessage>,
        deps: Arc<WorkerDeps>,
    ) -> Self {
        Self {
            task_id,
            server_id,
            kind,
            cancel,
            shutdown,
            tx,
            deps,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.deps.settings
    }

    pub fn health_sink(&self) -> broadcast::Sender<HealthReport> {
        self.deps.health_tx.clone()
    }

    pub fn progress(&self, step: impl Into<String>, current: u32, total: u32) {
        let _ = self.tx.send(WorkerMessage::Progress {
            step: step.into(),
            current,
            total,
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_from(level, message, self.kind.to_string());
    }

    pub fn log_from(&self, level: LogLevel, message: impl Into<String>, source: impl Into<String>) {
        let _ = self.tx.send(WorkerMessage::Log {
            level,
            message: message.into(),
            source: source.into(),
        });
    }

    fn finish(self, outcome: TaskOutcome) {
        let message = match outcome {
            Ok(result) => WorkerMessage::Complete(result),
            Err(e) => WorkerMessage::Error(e),
        };
        let _ = self.tx.send(message);
    }

    /// Run `fut` under a deadline, giving up early on cancellation
    pub async fn guard<T, F>(&self, limit: Duration, what: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AppError::Cancelled(format!("{} interrupted", what))),
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(AppError::Timeout(format!("{} did not finish within {:?}", what, limit))),
            },
        }
    }

    pub async fn sleep(&self, duration: Duration) -> AppResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AppError::Cancelled("interrupted while waiting".into())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Open a session, bounded by the handshake timeout
    pub async fn connect(&self, target: &SshTarget) -> AppResult<Arc<dyn RemoteSession>> {
        let limit = self.settings().ssh.handshake_timeout();
        let what = format!("SSH handshake with {}", target.host);
        self.guard(limit, &what, self.deps.connector.connect(target)).await
    }

    pub async fn exec(&self, session: &dyn RemoteSession, command: &str) -> AppResult<ExecOutput> {
        tracing::debug!("[{}] exec: {}", self.task_id, command);
        let limit = self.settings().ssh.command_timeout();
        self.guard(limit, "remote command", session.exec(command)).await
    }

    /// Like [`WorkerContext::exec`], failing on non-zero exit
    pub async fn run_checked(&self, session: &dyn RemoteSession, command: &str) -> AppResult<ExecOutput> {
        self.exec(session, command).await?.into_result(command)
    }
}

/// Worker entry point spawned by the runner
pub(crate) async fn execute(ctx: WorkerContext, config: TaskConfig) {
    let outcome = match config {
        TaskConfig::Test(c) => test::run(&ctx, c).await,
        TaskConfig::Deploy(c) => deploy::run(&ctx, c).await,
        TaskConfig::Connect(c) => connect::run(&ctx, c).await,
        TaskConfig::Chat(c) => chat::run(&ctx, c).await,
        TaskConfig::Disconnect(c) => disconnect::run(&ctx, c).await,
    };
    ctx.finish(outcome);
}
