//! Structured operation log
//!
//! Worker logs and server transitions are recorded as [`LogLine`]s. Every
//! message and detail passes through [`sanitize`] on construction, so
//! nothing downstream needs to redact again.

mod redact;
mod store;

pub use redact::sanitize;
pub use store::LogManager;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lenient parse for levels reported by remote scripts
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "fatal" | "critical" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

/// Which part of the engine produced a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSubsystem {
    Runner,
    Coordinator,
    Ssh,
    Tunnel,
    Deploy,
    Chat,
    Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// Unix millis
    pub timestamp: i64,
    pub level: LogLevel,
    pub subsystem: LogSubsystem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogLine {
    pub fn new(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            level,
            subsystem,
            server_id: None,
            task_id: None,
            message: sanitize(&message.into()),
            details: None,
        }
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(redact::sanitize_value(&details));
        self
    }
}

/// Query over recent lines; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Minimum level
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub subsystem: Option<LogSubsystem>,
    /// Case-insensitive substring of the message
    #[serde(default)]
    pub search: Option<String>,
    /// Unix millis
    #[serde(default)]
    pub since: Option<i64>,
}

impl LogFilter {
    pub fn matches(&self, line: &LogLine) -> bool {
        let same = |want: &Option<String>, have: &Option<String>| {
            want.as_ref().map_or(true, |w| have.as_ref() == Some(w))
        };
        same(&self.server_id, &line.server_id)
            && same(&self.task_id, &line.task_id)
            && self.level.map_or(true, |min| line.level >= min)
            && self.subsystem.map_or(true, |s| line.subsystem == s)
            && self.since.map_or(true, |since| line.timestamp >= since)
            && self.search.as_ref().map_or(true, |needle| {
                line.message.to_lowercase().contains(&needle.to_lowercase())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!(LogLevel::parse(" WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("critical"), LogLevel::Error);
        assert_eq!(LogLevel::parse("progress"), LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warn);
    }

    #[test]
    fn test_line_is_sanitized() {
        let line = LogLine::new(LogLevel::Info, LogSubsystem::Ssh, "auth with password=hunter2")
            .with_details(serde_json::json!({ "passphrase": "x" }));
        assert!(!line.message.contains("hunter2"));
        assert_eq!(line.details.unwrap()["passphrase"], "[REDACTED]");
    }

    #[test]
    fn test_filter_by_task_and_search() {
        let line = LogLine::new(LogLevel::Info, LogSubsystem::Deploy, "Pulling llama2:7b")
            .with_server("s1")
            .with_task("deploy-1");
        let by_task = LogFilter {
            task_id: Some("deploy-1".into()),
            search: Some("LLAMA".into()),
            ..Default::default()
        };
        assert!(by_task.matches(&line));
        let other = LogFilter {
            task_id: Some("deploy-2".into()),
            ..Default::default()
        };
        assert!(!other.matches(&line));
    }
}
