use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Bad or missing task configuration. Never reaches a worker.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing/ambiguous credential, or credential rejected by the remote side
    #[error("Authentication error: {0}")]
    Auth(String),

    /// SSH handshake or transport failure
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Port conflict: {0}")]
    PortConflict(String),

    #[error("Remote command `{command}` exited with status {exit_status}: {stderr}")]
    RemoteCommand {
        command: String,
        exit_status: i32,
        stderr: String,
    },

    #[error("Server {0} is not connected")]
    NotConnected(String),

    #[error("Server {0} is busy with another operation")]
    Busy(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),
}

impl AppError {
    /// Stable machine code used at the presentation boundary
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::Connect(_) => "CONNECT_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::PortConflict(_) => "PORT_CONFLICT",
            AppError::RemoteCommand { .. } => "REMOTE_COMMAND_ERROR",
            AppError::NotConnected(_) => "NOT_CONNECTED",
            AppError::Busy(_) => "BUSY",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::WorkerCrashed(_) => "WORKER_CRASHED",
            AppError::Ssh(_) => "SSH_ERROR",
            AppError::Network(_) => "NETWORK_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::ServerNotFound(_) => "SERVER_NOT_FOUND",
        }
    }
}

/// Serializable error for observers and event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (message, details) = match err {
            AppError::Auth(msg) => ("Authentication failed".to_string(), Some(msg.clone())),
            AppError::RemoteCommand { stderr, .. } => (err.to_string(), Some(stderr.clone())),
            other => (other.to_string(), None),
        };

        SerializableError {
            code: err.code().to_string(),
            message: crate::logging::sanitize(&message),
            details: details.map(|d| crate::logging::sanitize(&d)),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(format!("HTTP request timed out: {}", err))
        } else {
            AppError::Network(err.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::WorkerCrashed(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AppError::Busy("s1".into()).code(), "BUSY");
        assert_eq!(AppError::Timeout("ssh".into()).code(), "TIMEOUT");
        assert_eq!(AppError::Cancelled("x".into()).code(), "CANCELLED");
    }

    #[test]
    fn test_remote_command_keeps_stderr() {
        let err = AppError::RemoteCommand {
            command: "python3 --version".into(),
            exit_status: 127,
            stderr: "python3: not found".into(),
        };
        let ser = SerializableError::from(&err);
        assert_eq!(ser.code, "REMOTE_COMMAND_ERROR");
        assert!(ser.message.contains("127"));
        assert_eq!(ser.details.as_deref(), Some("python3: not found"));
    }

    #[test]
    fn test_auth_message_hides_detail() {
        let ser = SerializableError::from(&AppError::Auth("password=hunter2".into()));
        assert_eq!(ser.message, "Authentication failed");
        assert!(!ser.details.unwrap().contains("hunter2"));
    }
}
