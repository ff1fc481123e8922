//! # Task Executor
//!
//! Cluster task execution: the process registry, the script runner, and the
//! process manager that leases tasks from the coordinator, drives them
//! through the analyzer, and reports their lifecycle back.
//!
//! ## Architecture
//!
//! Every running task is represented by a [`TaskProcess`] held in the
//! [`registry::TaskRegistry`] for exactly the duration of its execution.
//! Registration is the admission check: a task id already present means the
//! coordinator re-dispatched something still running, and the duplicate is
//! rejected before any work starts. Kill requests act on the registry entry's
//! cancellation token; a kill for an id not in the registry is a no-op.

pub mod process_manager;
pub mod registry;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use process_manager::ProcessManager;
pub use registry::TaskRegistry;
pub use runner::{AnalyzeScriptRunner, ScriptRunner};

/// Task id reserved for interactive, synchronously awaited executions.
/// Interactive tasks are exempt from lifecycle reporting.
pub const INTERACTIVE_TASK_ID: i64 = 0;

/// A unit of work dispatched by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    /// Inline script body; written to a temp file before execution
    #[serde(default)]
    pub script: Option<Value>,
    /// Pre-staged script file, used when `script` is absent
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub args: Value,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Task {
    pub fn interactive(script: Value) -> Self {
        Self {
            id: INTERACTIVE_TASK_ID,
            job_id: None,
            parent_id: None,
            name: None,
            script: Some(script),
            script_path: None,
            env: HashMap::new(),
            work_dir: default_work_dir(),
            log_path: None,
            args: Value::Null,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.id == INTERACTIVE_TASK_ID
    }
}

/// Rolling counters a running script reports back mid-flight
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub success_count: u64,
    pub warning_count: u64,
    pub error_count: u64,
}

/// One structured error emitted by a running task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default)]
    pub processor: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    pub timestamp: DateTime<Utc>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            processor: None,
            path: None,
            skipped: false,
            timestamp: Utc::now(),
        }
    }
}

/// A sub-script a running task hands back to the coordinator for scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptPayload {
    #[serde(default)]
    pub name: Option<String>,
    pub script: Value,
}

/// One message a running script emits while executing
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Final structured response, consumed by interactive executions
    Response(Value),
    /// Expansion request: schedule this sub-script as a new task
    Expand(ScriptPayload),
    Stats(TaskStats),
    Error(TaskError),
}

/// Live handle to one queued-or-executing task
pub struct TaskProcess {
    task: Task,
    killed: AtomicBool,
    exit_status: AtomicI32,
    cancel: CancellationToken,
}

impl TaskProcess {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            killed: AtomicBool::new(false),
            exit_status: AtomicI32::new(-1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flag this process as killed and trigger its cancellation token.
    /// Returns true only for the first caller, so kill side effects run once.
    pub fn mark_killed(&self) -> bool {
        let first = !self.killed.swap(true, Ordering::SeqCst);
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::SeqCst);
    }

    /// Exit status, `-1` until the task finishes
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }
}

/// Outcome of an interactive execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_status: i32,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub errors: Vec<TaskError>,
}

/// Errors from the task execution layer
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("the task {0} is already queued or executing")]
    AlreadyRunning(i64),

    #[error("task execution is disabled on this node")]
    Disabled,

    #[error("invalid task script: {0}")]
    Script(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Analyze(#[from] crate::analyzer::AnalyzeError),

    #[error(transparent)]
    Client(#[from] crate::client::ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mark_killed_fires_once() {
        let process = TaskProcess::new(Task::interactive(json!({})));
        assert!(!process.is_killed());
        assert!(process.mark_killed());
        assert!(!process.mark_killed());
        assert!(process.is_killed());
        assert!(process.cancel_token().is_cancelled());
    }

    #[test]
    fn test_exit_status_defaults_to_minus_one() {
        let process = TaskProcess::new(Task::interactive(json!({})));
        assert_eq!(process.exit_status(), -1);
        process.set_exit_status(0);
        assert_eq!(process.exit_status(), 0);
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(r#"{"id": 17, "script": {"name": "x"}}"#).unwrap();
        assert_eq!(task.id, 17);
        assert!(!task.is_interactive());
        assert!(task.env.is_empty());
        assert!(task.log_path.is_none());
    }
}
