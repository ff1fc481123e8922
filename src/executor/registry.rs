//! # Task Registry
//!
//! Concurrent map of every task currently queued or executing on this node.
//! Insertion doubles as the duplicate-dispatch admission check: the insert is
//! atomic, so two arrivals of the same task id can never both register.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{ExecutorError, TaskProcess};

/// Registry of live task processes keyed by task id
#[derive(Default)]
pub struct TaskRegistry {
    processes: DashMap<i64, Arc<TaskProcess>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process under its task id. Fails with
    /// [`ExecutorError::AlreadyRunning`] when the id is already present;
    /// nothing about the existing entry changes in that case.
    pub fn register(&self, process: Arc<TaskProcess>) -> Result<(), ExecutorError> {
        let task_id = process.task().id;
        match self.processes.entry(task_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ExecutorError::AlreadyRunning(task_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(task_id = task_id, "Registered task process");
                slot.insert(process);
                Ok(())
            }
        }
    }

    pub fn get(&self, task_id: i64) -> Option<Arc<TaskProcess>> {
        self.processes.get(&task_id).map(|entry| entry.clone())
    }

    /// Remove and return the process for a task id, if present
    pub fn remove(&self, task_id: i64) -> Option<Arc<TaskProcess>> {
        self.processes.remove(&task_id).map(|(_, process)| process)
    }

    /// Snapshot of the currently registered task ids
    pub fn task_ids(&self) -> Vec<i64> {
        self.processes.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
