use crate::error::AppResult;
use crate::runner::TaskKind;
use crate::ssh::{Credential, SshTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One managed remote server, as persisted.
///
/// `status` is not stored: it is derived by [`ServerStatus::derive`] from the
/// flags below plus the in-flight task the coordinator tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_deploy_path")]
    pub deploy_path: String,
    #[serde(default = "default_llm_port")]
    pub llm_port: u16,
    #[serde(default)]
    pub deployed: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_deploy_path() -> String {
    "/opt/llm".to_string()
}

fn default_llm_port() -> u16 {
    11434
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            private_key_path: None,
            passphrase: None,
            password: None,
            deploy_path: default_deploy_path(),
            llm_port: default_llm_port(),
            deployed: false,
            connected: false,
            last_check: None,
            disconnected_at: None,
            error: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// Exactly one credential must be configured.
    pub fn credential(&self) -> AppResult<Credential> {
        self.ssh_target().credential()
    }

    /// Credentials are checked when a task is validated, not here.
    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            private_key_path: self.private_key_path.clone(),
            passphrase: self.passphrase.clone(),
            password: self.password.clone(),
        }
    }

    /// `connected` implies `deployed`.
    pub fn is_consistent(&self) -> bool {
        !self.connected || self.deployed
    }
}

/// Observable server status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Idle,
    Testing,
    Deploying,
    Deployed,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl ServerStatus {
    /// Pure projection of a record and the kind of its in-flight task.
    pub fn derive(record: &ServerRecord, in_flight: Option<TaskKind>) -> Self {
        match in_flight {
            Some(TaskKind::Test) => return ServerStatus::Testing,
            Some(TaskKind::Deploy) => return ServerStatus::Deploying,
            Some(TaskKind::Connect) => return ServerStatus::Connecting,
            Some(TaskKind::Disconnect) => return ServerStatus::Disconnecting,
            Some(TaskKind::Chat) | None => {}
        }

        if record.error.is_some() {
            ServerStatus::Error
        } else if record.connected {
            ServerStatus::Connected
        } else if record.disconnected_at.is_some() {
            ServerStatus::Disconnected
        } else if record.deployed {
            ServerStatus::Deployed
        } else {
            ServerStatus::Idle
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Idle => "idle",
            ServerStatus::Testing => "testing",
            ServerStatus::Deploying => "deploying",
            ServerStatus::Deployed => "deployed",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnecting => "disconnecting",
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Consistent view of a server published to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub llm_port: u16,
    pub status: ServerStatus,
    pub deployed: bool,
    pub connected: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl ServerSnapshot {
    pub fn capture(
        record: &ServerRecord,
        in_flight: Option<(&str, TaskKind)>,
        local_port: Option<u16>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            host: record.host.clone(),
            port: record.port,
            llm_port: record.llm_port,
            status: ServerStatus::derive(record, in_flight.map(|(_, kind)| kind)),
            deployed: record.deployed,
            connected: record.connected,
            last_check: record.last_check,
            error: record.error.clone(),
            active_task: in_flight.map(|(id, _)| id.to_string()),
            local_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn record() -> ServerRecord {
        ServerRecord::new("s1", "10.0.0.5", "llm").with_password("pw")
    }

    #[test]
    fn test_in_flight_task_dominates() {
        let mut r = record();
        r.error = Some("boom".into());
        assert_eq!(ServerStatus::derive(&r, Some(TaskKind::Deploy)), ServerStatus::Deploying);
        assert_eq!(ServerStatus::derive(&r, None), ServerStatus::Error);
    }

    #[test]
    fn test_chat_does_not_change_status() {
        let mut r = record();
        r.deployed = true;
        r.connected = true;
        assert_eq!(ServerStatus::derive(&r, Some(TaskKind::Chat)), ServerStatus::Connected);
    }

    #[test]
    fn test_resting_states() {
        let mut r = record();
        assert_eq!(ServerStatus::derive(&r, None), ServerStatus::Idle);
        r.deployed = true;
        assert_eq!(ServerStatus::derive(&r, None), ServerStatus::Deployed);
        r.connected = true;
        assert_eq!(ServerStatus::derive(&r, None), ServerStatus::Connected);
        r.connected = false;
        r.disconnected_at = Some(Utc::now());
        assert_eq!(ServerStatus::derive(&r, None), ServerStatus::Disconnected);
    }

    #[test]
    fn test_credential_must_be_exactly_one() {
        let r = ServerRecord::new("s1", "h", "u");
        assert!(matches!(r.credential(), Err(AppError::Auth(_))));

        let r = ServerRecord::new("s1", "h", "u").with_password("p").with_key("/k");
        assert!(matches!(r.credential(), Err(AppError::Auth(_))));

        let r = ServerRecord::new("s1", "h", "u").with_key("/home/u/.ssh/id_ed25519");
        assert!(matches!(r.credential(), Ok(Credential::KeyFile { .. })));
    }

    #[test]
    fn test_consistency() {
        let mut r = record();
        r.connected = true;
        assert!(!r.is_consistent());
        r.deployed = true;
        assert!(r.is_consistent());
    }
}
