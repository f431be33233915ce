use super::task::{TaskId, TaskKind, TaskResult};
use crate::error::{AppError, SerializableError};
use crate::logging::LogLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a worker reports back to the runner
#[derive(Debug)]
pub enum WorkerMessage {
    Progress {
        step: String,
        current: u32,
        total: u32,
    },
    Log {
        level: LogLevel,
        message: String,
        source: String,
    },
    Complete(TaskResult),
    Error(AppError),
}

/// Relayed task event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub server_id: String,
    pub kind: TaskKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: TaskEventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TaskEventPayload {
    Progress {
        step: String,
        current: u32,
        total: u32,
        percentage: u8,
    },
    Log {
        level: LogLevel,
        message: String,
        source: String,
    },
    Complete {
        result: serde_json::Value,
    },
    Error {
        error: SerializableError,
    },
}

impl TaskEventPayload {
    pub fn progress(step: String, current: u32, total: u32) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            (u64::from(current.min(total)) * 100 / u64::from(total)) as u8
        };
        TaskEventPayload::Progress {
            step,
            current,
            total,
            percentage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventPayload::Complete { .. } | TaskEventPayload::Error { .. }
        )
    }
}
