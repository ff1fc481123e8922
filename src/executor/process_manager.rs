//! # Process Manager
//!
//! Owns the lifetime of every cluster task on this node: admission through
//! the registry, concurrency through a bounded permit pool, execution through
//! the script runner, and lifecycle reporting back to the coordinator.
//!
//! ## Lifecycle guarantees
//!
//! However a task ends (success, failure, kill, or a runner error), the
//! cleanup path always runs: the staged temp script is deleted, the registry
//! entry is removed, and exactly one stop report carries the final exit
//! status. Interactive tasks (id `0`) bypass the registry and the lifecycle
//! reports entirely.
//!
//! ## Scheduling
//!
//! A polling loop asks coordinator hosts for pending work whenever local
//! capacity is free. The host list is re-shuffled on a refresh interval so
//! load spreads across coordinator replicas, and a host that fails a fetch
//! sits out a backoff window before it is tried again. Every failure inside
//! the loop is caught and logged; the scheduler itself never dies.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::CoordinatorClient;
use crate::config::AnalystConfig;
use crate::logging::log_task_operation;

use super::registry::TaskRegistry;
use super::runner::{ScriptRunner, EXIT_FAILED};
use super::{
    ExecutorError, Reaction, Task, TaskError, TaskProcess, TaskResult, INTERACTIVE_TASK_ID,
};

/// Control commands accepted while tasks are running
#[derive(Debug)]
pub enum Command {
    Kill {
        task_id: i64,
        user: String,
        reason: String,
    },
}

struct HostState {
    hosts: Vec<String>,
    refreshed_at: Option<Instant>,
    backoff_until: HashMap<String, Instant>,
}

struct StagedScript {
    script: serde_json::Value,
    /// Temp file holding an inline script body, deleted at cleanup
    temp_path: Option<PathBuf>,
}

/// Manages queued and executing cluster tasks on this node
pub struct ProcessManager {
    config: AnalystConfig,
    registry: Arc<TaskRegistry>,
    runner: Arc<dyn ScriptRunner>,
    client: Arc<dyn CoordinatorClient>,
    permits: Arc<Semaphore>,
    hosts: Mutex<HostState>,
    shutdown: CancellationToken,
}

impl ProcessManager {
    pub fn new(
        config: AnalystConfig,
        registry: Arc<TaskRegistry>,
        runner: Arc<dyn ScriptRunner>,
        client: Arc<dyn CoordinatorClient>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.executor.worker_threads));
        Arc::new(Self {
            config,
            registry,
            runner,
            client,
            permits,
            hosts: Mutex::new(HostState {
                hosts: Vec::new(),
                refreshed_at: None,
                backoff_until: HashMap::new(),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        info!("🛑 Process manager shutting down");
        self.shutdown.cancel();
    }

    /// Admit a coordinator-dispatched task and execute it in the background.
    /// Returns as soon as the task is registered; a duplicate id is rejected
    /// without touching the already-running task.
    pub fn queue_cluster_task(self: &Arc<Self>, task: Task) -> Result<(), ExecutorError> {
        if !self.config.executor.execute_enabled {
            return Err(ExecutorError::Disabled);
        }
        if task.id == INTERACTIVE_TASK_ID {
            return Err(ExecutorError::Script(
                "cluster tasks require a nonzero id".to_string(),
            ));
        }

        let process = Arc::new(TaskProcess::new(task));
        self.registry.register(Arc::clone(&process))?;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match manager.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            manager.run_cluster_process(process).await;
            drop(permit);
        });
        Ok(())
    }

    /// Execute a task synchronously for an interactive caller. No registry
    /// entry, no lifecycle reports; the caller gets the collected result.
    pub async fn execute_cluster_task(&self, task: Task) -> Result<TaskResult, ExecutorError> {
        let process = Arc::new(TaskProcess::new(task));
        let staged = self.stage_script(process.task()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector: JoinHandle<TaskResult> = tokio::spawn(async move {
            let mut result = TaskResult::default();
            while let Some(reaction) = rx.recv().await {
                match reaction {
                    Reaction::Response(value) => result.response = Some(value),
                    Reaction::Error(error) => result.errors.push(error),
                    Reaction::Stats(_) | Reaction::Expand(_) => {}
                }
            }
            result
        });

        let run = self
            .runner
            .run(process.task(), &staged.script, &tx, process.cancel_token())
            .await;
        drop(tx);
        let mut result = collector.await.unwrap_or_default();
        Self::discard_temp(&staged).await;

        result.exit_status = run?;
        process.set_exit_status(result.exit_status);
        Ok(result)
    }

    /// Kill a running task. Unknown ids are ignored; killing twice has no
    /// further effect. Returns whether this call actually stopped something.
    pub async fn kill(&self, task_id: i64, user: &str, reason: &str) -> bool {
        let Some(process) = self.registry.get(task_id) else {
            warn!(task_id = task_id, "Kill requested for unknown task, ignoring");
            return false;
        };
        if !process.mark_killed() {
            debug!(task_id = task_id, "Task already killed");
            return false;
        }

        info!(task_id = task_id, user = user, reason = reason, "🛑 Killing task");
        if let Some(log_path) = &process.task().log_path {
            let line = format!("Process killed by {user}, reason: {reason}\n");
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(task_id = task_id, error = %e, "Could not append kill note");
                    }
                }
                Err(e) => warn!(task_id = task_id, error = %e, "Could not open task log"),
            }
        }
        true
    }

    /// Consume control commands until the channel closes or shutdown fires
    pub fn spawn_command_loop(self: &Arc<Self>) -> (mpsc::UnboundedSender<Command>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(Command::Kill { task_id, user, reason }) => {
                            manager.kill(task_id, &user, &reason).await;
                        }
                        None => break,
                    },
                }
            }
        });
        (tx, handle)
    }

    /// Poll coordinator hosts for pending work on a fixed interval
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => manager.poll_once().await,
                }
            }
        })
    }

    async fn poll_once(self: &Arc<Self>) {
        if !self.config.executor.execute_enabled {
            return;
        }
        let capacity = self.permits.available_permits();
        if capacity == 0 {
            return;
        }

        let mut remaining = capacity;
        for host in self.eligible_hosts() {
            if remaining == 0 {
                break;
            }
            let fetched = self
                .client
                .fetch_pending_tasks(&host, &self.config.coordinator.node_addr, remaining)
                .await;
            match fetched {
                Ok(tasks) => {
                    for task in tasks {
                        let task_id = task.id;
                        match self.queue_cluster_task(task) {
                            Ok(()) => remaining = remaining.saturating_sub(1),
                            Err(ExecutorError::AlreadyRunning(_)) => {
                                // coordinator re-dispatched something still running
                                debug!(task_id = task_id, "Ignoring duplicate dispatch");
                            }
                            Err(e) => {
                                warn!(task_id = task_id, error = %e, "Could not queue task")
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Pending-task fetch failed, backing off");
                    self.hosts
                        .lock()
                        .backoff_until
                        .insert(host, Instant::now() + self.config.host_backoff());
                }
            }
        }
    }

    /// Coordinator hosts worth polling right now: the configured list,
    /// re-shuffled at most once per refresh interval, minus hosts inside a
    /// backoff window
    fn eligible_hosts(&self) -> Vec<String> {
        let mut state = self.hosts.lock();
        let now = Instant::now();

        let stale = state
            .refreshed_at
            .is_none_or(|at| now.duration_since(at) >= self.config.host_refresh_interval());
        if stale {
            let mut hosts = self.config.coordinator.hosts.clone();
            hosts.shuffle(&mut rand::thread_rng());
            state.hosts = hosts;
            state.refreshed_at = Some(now);
        }

        state.backoff_until.retain(|_, until| *until > now);
        state
            .hosts
            .iter()
            .filter(|host| !state.backoff_until.contains_key(*host))
            .cloned()
            .collect()
    }

    #[instrument(skip(self, process), fields(task_id = process.task().id))]
    async fn run_cluster_process(self: &Arc<Self>, process: Arc<TaskProcess>) {
        let task_id = process.task().id;
        let job_id = process.task().job_id;

        let (exit_status, staged) = self.drive(&process).await;
        process.set_exit_status(exit_status);

        if let Some(staged) = staged {
            Self::discard_temp(&staged).await;
        }

        // The stop report fires once, from whichever path removed the entry
        if self.registry.remove(task_id).is_some() {
            if let Err(e) = self.client.report_task_stopped(task_id, exit_status).await {
                warn!(task_id = task_id, error = %e, "Stop report failed");
            }
        }
        log_task_operation(
            "execute",
            Some(task_id),
            job_id,
            if exit_status == 0 { "completed" } else { "failed" },
            Some(&format!("exit_status={exit_status}")),
        );
    }

    async fn drive(&self, process: &Arc<TaskProcess>) -> (i32, Option<StagedScript>) {
        let task = process.task();

        // A kill can land while the task is still waiting for a permit
        if process.is_killed() {
            info!(task_id = task.id, "Task was killed before it started");
            return (super::runner::EXIT_KILLED, None);
        }

        let staged = match self.stage_script(task).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "❌ Could not stage task script");
                let report = self
                    .client
                    .report_task_errors(task.id, &[TaskError::new(e.to_string())])
                    .await;
                if let Err(e) = report {
                    warn!(task_id = task.id, error = %e, "Error report failed");
                }
                return (EXIT_FAILED, None);
            }
        };

        if let Some(parent) = task.log_path.as_ref().and_then(|p| p.parent()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(task_id = task.id, error = %e, "Could not create log directory");
            }
        }

        if let Err(e) = self.client.report_task_started(task.id).await {
            warn!(task_id = task.id, error = %e, "Start report failed");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = {
            let client = Arc::clone(&self.client);
            let process = Arc::clone(process);
            let task_id = task.id;
            tokio::spawn(async move {
                while let Some(reaction) = rx.recv().await {
                    // A killed task's late reactions are dropped on the floor
                    if process.is_killed() {
                        break;
                    }
                    let outcome = match reaction {
                        Reaction::Stats(stats) => client.report_task_stats(task_id, &stats).await,
                        Reaction::Error(error) => {
                            client.report_task_errors(task_id, &[error]).await
                        }
                        Reaction::Expand(payload) => client.report_expand(task_id, &payload).await,
                        Reaction::Response(_) => Ok(()),
                    };
                    if let Err(e) = outcome {
                        warn!(task_id = task_id, error = %e, "Reaction report failed");
                    }
                }
            })
        };

        let exit_status = match self
            .runner
            .run(task, &staged.script, &tx, process.cancel_token())
            .await
        {
            Ok(code) => code,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "❌ Task runner failed");
                let _ = tx.send(Reaction::Error(TaskError::new(e.to_string())));
                EXIT_FAILED
            }
        };
        drop(tx);
        let _ = forwarder.await;

        (exit_status, Some(staged))
    }

    /// Resolve the task's script body. Inline scripts are also written to a
    /// temp file so operators can inspect exactly what ran; the copy is
    /// removed at cleanup.
    async fn stage_script(&self, task: &Task) -> Result<StagedScript, ExecutorError> {
        if let Some(script) = &task.script {
            let temp_path = std::env::temp_dir().join(format!("{}.json", Uuid::new_v4()));
            let body = serde_json::to_vec_pretty(script)
                .map_err(|e| ExecutorError::Script(e.to_string()))?;
            tokio::fs::write(&temp_path, body).await?;
            return Ok(StagedScript {
                script: script.clone(),
                temp_path: Some(temp_path),
            });
        }

        if let Some(path) = &task.script_path {
            let bytes = tokio::fs::read(path).await?;
            let script =
                serde_json::from_slice(&bytes).map_err(|e| ExecutorError::Script(e.to_string()))?;
            return Ok(StagedScript {
                script,
                temp_path: None,
            });
        }

        Err(ExecutorError::Script("task has no script".to_string()))
    }

    async fn discard_temp(staged: &StagedScript) {
        if let Some(path) = &staged.temp_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %e, "Temp script already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzeResult;
    use crate::client::ClientError;
    use crate::executor::{ScriptPayload, TaskStats};
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl CoordinatorClient for NullClient {
        async fn fetch_pending_tasks(
            &self,
            _coordinator: &str,
            _node_addr: &str,
            _max: usize,
        ) -> Result<Vec<Task>, ClientError> {
            Ok(Vec::new())
        }

        async fn report_task_started(&self, _task_id: i64) -> Result<(), ClientError> {
            Ok(())
        }

        async fn report_task_stopped(
            &self,
            _task_id: i64,
            _exit_status: i32,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn report_task_stats(
            &self,
            _task_id: i64,
            _stats: &TaskStats,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn report_task_errors(
            &self,
            _task_id: i64,
            _errors: &[TaskError],
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn report_expand(
            &self,
            _task_id: i64,
            _payload: &ScriptPayload,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn report_batch_complete(
            &self,
            _request_id: uuid::Uuid,
            _result: &AnalyzeResult,
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct IdleRunner;

    #[async_trait]
    impl ScriptRunner for IdleRunner {
        async fn run(
            &self,
            _task: &Task,
            _script: &serde_json::Value,
            _reactions: &mpsc::UnboundedSender<Reaction>,
            _cancel: &CancellationToken,
        ) -> Result<i32, ExecutorError> {
            Ok(0)
        }
    }

    fn manager() -> Arc<ProcessManager> {
        ProcessManager::new(
            AnalystConfig::default(),
            Arc::new(TaskRegistry::new()),
            Arc::new(IdleRunner),
            Arc::new(NullClient),
        )
    }

    #[tokio::test]
    async fn test_kill_of_unknown_task_is_a_no_op() {
        let manager = manager();
        assert!(!manager.kill(404, "admin", "stuck").await);
    }

    #[tokio::test]
    async fn test_interactive_ids_cannot_be_queued() {
        let manager = manager();
        let task = Task::interactive(serde_json::json!({}));
        assert!(matches!(
            manager.queue_cluster_task(task),
            Err(ExecutorError::Script(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_node_rejects_work() {
        let mut config = AnalystConfig::default();
        config.executor.execute_enabled = false;
        let manager = ProcessManager::new(
            config,
            Arc::new(TaskRegistry::new()),
            Arc::new(IdleRunner),
            Arc::new(NullClient),
        );

        let mut task = Task::interactive(serde_json::json!({}));
        task.id = 7;
        assert!(matches!(
            manager.queue_cluster_task(task),
            Err(ExecutorError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_eligible_hosts_honors_backoff() {
        let manager = manager();
        assert_eq!(manager.eligible_hosts().len(), 1);

        manager.hosts.lock().backoff_until.insert(
            "http://localhost:8066".to_string(),
            Instant::now() + std::time::Duration::from_secs(60),
        );
        assert!(manager.eligible_hosts().is_empty());
    }
}
