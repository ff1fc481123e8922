//! # Script Runner
//!
//! Translates a task's script body into work. The production runner drives
//! the batch analyzer in-process; the trait seam exists so the process
//! manager's queueing, cleanup, and reporting can be tested against a
//! scripted fake.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::{AnalyzeError, AnalyzeRequest, BatchAnalyzer};
use crate::service::SlotPool;

use super::{ExecutorError, Reaction, ScriptPayload, Task, TaskError, TaskStats};

/// Exit status of a task that ran to completion
pub const EXIT_OK: i32 = 0;
/// Exit status of a task whose batch failed outright
pub const EXIT_FAILED: i32 = 1;
/// Exit status of a task stopped by a kill request
pub const EXIT_KILLED: i32 = 13;

/// Parsed task script body
#[derive(Debug, Deserialize)]
pub struct ScriptBody {
    #[serde(default)]
    pub name: Option<String>,
    /// The batch this task executes
    pub analyze: AnalyzeRequest,
    /// Sub-scripts to hand back to the coordinator once the batch succeeds
    #[serde(default)]
    pub expand: Vec<ScriptPayload>,
}

/// Parse a raw script value, naming what is wrong when it does not conform
pub fn parse_script(script: &Value) -> Result<ScriptBody, ExecutorError> {
    serde_json::from_value(script.clone()).map_err(|e| ExecutorError::Script(e.to_string()))
}

/// Executes one task's script, emitting reactions along the way, and returns
/// the task's exit status
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        script: &Value,
        reactions: &mpsc::UnboundedSender<Reaction>,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecutorError>;
}

/// Production runner: leases a worker slot and drives the batch analyzer
pub struct AnalyzeScriptRunner {
    analyzer: Arc<BatchAnalyzer>,
    slots: Arc<SlotPool>,
}

impl AnalyzeScriptRunner {
    pub fn new(analyzer: Arc<BatchAnalyzer>, slots: Arc<SlotPool>) -> Self {
        Self { analyzer, slots }
    }
}

#[async_trait]
impl ScriptRunner for AnalyzeScriptRunner {
    async fn run(
        &self,
        task: &Task,
        script: &Value,
        reactions: &mpsc::UnboundedSender<Reaction>,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecutorError> {
        let body = parse_script(script)?;
        let slot = self.slots.lease().await;

        info!(
            task_id = task.id,
            slot = slot.id(),
            script = body.name.as_deref().unwrap_or("unnamed"),
            "🔧 Running task script"
        );

        match self
            .analyzer
            .analyze(slot.id(), &body.analyze, Some(cancel))
            .await
        {
            Ok(result) => {
                let stats = TaskStats {
                    success_count: result.created + result.updated,
                    warning_count: result.warnings,
                    error_count: result.errors,
                };
                let _ = reactions.send(Reaction::Stats(stats));
                for expand in body.expand {
                    let _ = reactions.send(Reaction::Expand(expand));
                }
                match serde_json::to_value(&result) {
                    Ok(response) => {
                        let _ = reactions.send(Reaction::Response(response));
                    }
                    Err(e) => warn!(task_id = task.id, error = %e, "Could not encode result"),
                }
                Ok(EXIT_OK)
            }
            Err(AnalyzeError::Cancelled) => {
                info!(task_id = task.id, "Task stopped by kill request");
                Ok(EXIT_KILLED)
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "❌ Batch failed");
                let _ = reactions.send(Reaction::Error(TaskError::new(e.to_string())));
                Ok(EXIT_FAILED)
            }
        }
    }
}
