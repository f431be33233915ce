//! Remote Session Capability
//!
//! Workers only talk to remote hosts through [`SessionConnector`] and
//! [`RemoteSession`]. The production implementation is [`Ssh2Connector`];
//! tests plug in their own.

pub mod session;

pub use session::*;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Resolved SSH credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

/// Where and as whom to connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl SshTarget {
    /// Exactly one of private key path and password must be set.
    pub fn credential(&self) -> AppResult<Credential> {
        match (&self.private_key_path, &self.password) {
            (Some(path), None) => Ok(Credential::KeyFile {
                path: path.clone(),
                passphrase: self.passphrase.clone(),
            }),
            (None, Some(password)) => Ok(Credential::Password(password.clone())),
            (Some(_), Some(_)) => Err(AppError::Auth(format!(
                "both a private key and a password are configured for {}@{}",
                self.username, self.host
            ))),
            (None, None) => Err(AppError::Auth(format!(
                "no private key or password configured for {}@{}",
                self.username, self.host
            ))),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::Validation("host is required".into()));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::Validation("username is required".into()));
        }
        if self.port == 0 {
            return Err(AppError::Validation("SSH port must be non-zero".into()));
        }
        self.credential().map(|_| ())
    }

    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-zero exit becomes [`AppError::RemoteCommand`] with stderr preserved.
    pub fn into_result(self, command: &str) -> AppResult<ExecOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::RemoteCommand {
                command: command.to_string(),
                exit_status: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Byte stream carried through a forwarded channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

pub type BoxedStream = Box<dyn ForwardStream>;

/// An authenticated session with one remote host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `SHA256:<base64>` of the server host key, when known
    fn host_fingerprint(&self) -> Option<String>;

    async fn exec(&self, command: &str) -> AppResult<ExecOutput>;

    async fn transfer(&self, local_path: &Path, remote_path: &str) -> AppResult<()>;

    /// Open one forwarded channel to `remote_host:remote_port` as seen from the server
    async fn open_forward(&self, remote_host: &str, remote_port: u16) -> AppResult<BoxedStream>;

    /// Idempotent
    async fn close(&self);
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> AppResult<Arc<dyn RemoteSession>>;
}

/// Single-quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}
