use super::record::ServerSnapshot;
use crate::logging::LogLevel;
use crate::runner::TaskKind;
use serde::{Deserialize, Serialize};

/// Everything observers can see, each tagged with its server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        server_id: String,
        task_id: String,
        kind: TaskKind,
        step: String,
        current: u32,
        total: u32,
        percentage: u8,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        server_id: String,
        task_id: String,
        level: LogLevel,
        message: String,
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    StatusChange {
        server_id: String,
        server: ServerSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    DeploymentProgress {
        server_id: String,
        task_id: String,
        percentage: u8,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionTested {
        server_id: String,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    ServerReady {
        server_id: String,
        local_port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Health {
        server_id: String,
        local_port: u16,
        healthy: bool,
    },
}

impl EngineEvent {
    pub fn server_id(&self) -> &str {
        match self {
            EngineEvent::Progress { server_id, .. }
            | EngineEvent::Log { server_id, .. }
            | EngineEvent::StatusChange { server_id, .. }
            | EngineEvent::DeploymentProgress { server_id, .. }
            | EngineEvent::ConnectionTested { server_id, .. }
            | EngineEvent::ServerReady { server_id, .. }
            | EngineEvent::Health { server_id, .. } => server_id,
        }
    }
}
