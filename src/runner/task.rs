use crate::error::{AppError, AppResult};
use crate::llm::{ChatMessage, ChatReply};
use crate::ssh::SshTarget;
use crate::tunnel::{TunnelHandle, TunnelInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Test,
    Deploy,
    Connect,
    Chat,
    Disconnect,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Test => "test",
            TaskKind::Deploy => "deploy",
            TaskKind::Connect => "connect",
            TaskKind::Chat => "chat",
            TaskKind::Disconnect => "disconnect",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Bookkeeping for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: TaskKind,
    pub server_id: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub server_id: String,
    pub target: SshTarget,
    /// Also probe the LLM server when deployed
    pub deployed: bool,
    pub llm_port: u16,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub server_id: String,
    pub target: SshTarget,
    pub deploy_path: String,
    pub llm_port: u16,
    pub listen_host: String,
    pub models: Vec<String>,
    /// Uploaded instead of the bundled script when set
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub server_id: String,
    pub target: SshTarget,
    pub remote_port: u16,
    /// Start of the port scan; `remote_port + offset` when unset
    pub local_port: Option<u16>,
    /// Ports held by other tunnels
    pub reserved_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub server_id: String,
    pub local_port: u16,
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DisconnectConfig {
    pub server_id: String,
    pub tunnel: Option<TunnelHandle>,
}

/// Per-kind task input
#[derive(Debug, Clone)]
pub enum TaskConfig {
    Test(TestConfig),
    Deploy(DeployConfig),
    Connect(ConnectConfig),
    Chat(ChatConfig),
    Disconnect(DisconnectConfig),
}

impl TaskConfig {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskConfig::Test(_) => TaskKind::Test,
            TaskConfig::Deploy(_) => TaskKind::Deploy,
            TaskConfig::Connect(_) => TaskKind::Connect,
            TaskConfig::Chat(_) => TaskKind::Chat,
            TaskConfig::Disconnect(_) => TaskKind::Disconnect,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            TaskConfig::Test(c) => &c.server_id,
            TaskConfig::Deploy(c) => &c.server_id,
            TaskConfig::Connect(c) => &c.server_id,
            TaskConfig::Chat(c) => &c.server_id,
            TaskConfig::Disconnect(c) => &c.server_id,
        }
    }

    /// Checked before any worker starts.
    pub fn validate(&self) -> AppResult<()> {
        if self.server_id().trim().is_empty() {
            return Err(AppError::Validation("server id is required".into()));
        }
        match self {
            TaskConfig::Test(c) => {
                c.target.validate()?;
                if c.deployed {
                    require_port(c.llm_port, "LLM port")?;
                }
                Ok(())
            }
            TaskConfig::Deploy(c) => {
                c.target.validate()?;
                require_port(c.llm_port, "LLM port")?;
                if !c.deploy_path.starts_with('/') {
                    return Err(AppError::Validation(format!(
                        "deploy path must be absolute, got {:?}",
                        c.deploy_path
                    )));
                }
                if c.listen_host.trim().is_empty() {
                    return Err(AppError::Validation("listen host is required".into()));
                }
                if let Some(path) = &c.script_path {
                    if !path.is_file() {
                        return Err(AppError::Validation(format!(
                            "deploy script {} does not exist",
                            path.display()
                        )));
                    }
                }
                Ok(())
            }
            TaskConfig::Connect(c) => {
                c.target.validate()?;
                require_port(c.remote_port, "remote port")
            }
            TaskConfig::Chat(c) => {
                require_port(c.local_port, "local port")?;
                if c.messages.is_empty() {
                    return Err(AppError::Validation("chat needs at least one message".into()));
                }
                Ok(())
            }
            TaskConfig::Disconnect(_) => Ok(()),
        }
    }
}

fn require_port(port: u16, what: &str) -> AppResult<()> {
    if port == 0 {
        return Err(AppError::Validation(format!("{} must be non-zero", what)));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub system: String,
    pub fingerprint: Option<String>,
    /// `None` when the server is not deployed
    pub llm_healthy: Option<bool>,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.llm_healthy.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub deploy_path: String,
    pub llm_port: u16,
    pub remote_script: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectReport {
    pub tunnel: TunnelHandle,
    pub healthy: bool,
    pub fingerprint: Option<String>,
}

/// Successful task payload
#[derive(Debug, Clone)]
pub enum TaskResult {
    Tested(TestReport),
    Deployed(DeployReport),
    Connected(ConnectReport),
    Chat(ChatReply),
    Disconnected { local_port: Option<u16> },
}

impl TaskResult {
    /// JSON form carried by `complete` events
    pub fn summary(&self) -> serde_json::Value {
        match self {
            TaskResult::Tested(r) => json!(r),
            TaskResult::Deployed(r) => json!(r),
            TaskResult::Connected(r) => {
                let info: TunnelInfo = r.tunnel.info();
                json!({
                    "tunnel": info,
                    "healthy": r.healthy,
                    "fingerprint": r.fingerprint,
                })
            }
            TaskResult::Chat(reply) => json!(reply),
            TaskResult::Disconnected { local_port } => json!({ "localPort": local_port }),
        }
    }
}

/// Terminal result of a task
pub type TaskOutcome = Result<TaskResult, AppError>;
