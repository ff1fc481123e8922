//! # Coordinator Client
//!
//! HTTP client for the coordinator tier: task leasing, lifecycle reports,
//! and batch completion callbacks. The executor talks to the coordinator only
//! through the [`CoordinatorClient`] trait so tests can substitute a
//! recording implementation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::AnalyzeResult;
use crate::config::CoordinatorConfig;
use crate::executor::{ScriptPayload, Task, TaskError, TaskStats};

/// Errors from coordinator communication
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("coordinator rejected request: status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no coordinator host configured")]
    NoHosts,
}

/// Everything the executor needs from the coordinator tier
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Lease up to `max` pending tasks from one coordinator host, announcing
    /// this node's callback address
    async fn fetch_pending_tasks(
        &self,
        coordinator: &str,
        node_addr: &str,
        max: usize,
    ) -> Result<Vec<Task>, ClientError>;

    async fn report_task_started(&self, task_id: i64) -> Result<(), ClientError>;

    async fn report_task_stopped(&self, task_id: i64, exit_status: i32) -> Result<(), ClientError>;

    async fn report_task_stats(&self, task_id: i64, stats: &TaskStats) -> Result<(), ClientError>;

    async fn report_task_errors(
        &self,
        task_id: i64,
        errors: &[TaskError],
    ) -> Result<(), ClientError>;

    /// Hand a dynamically discovered sub-script back to the coordinator for
    /// scheduling
    async fn report_expand(&self, task_id: i64, payload: &ScriptPayload)
        -> Result<(), ClientError>;

    /// Terminal callback for a detached analysis request
    async fn report_batch_complete(
        &self,
        request_id: Uuid,
        result: &AnalyzeResult,
    ) -> Result<(), ClientError>;
}

/// Production client backed by `reqwest`
pub struct HttpCoordinatorClient {
    client: reqwest::Client,
    /// Primary coordinator for lifecycle reports; task leasing addresses
    /// whichever host the scheduler picked
    base_url: String,
}

impl HttpCoordinatorClient {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent("analyst-core");

        if let Some(token) = &config.auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            if let Ok(mut value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            {
                value.set_sensitive(true);
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
            builder = builder.default_headers(headers);
        }

        let base_url = config
            .hosts
            .first()
            .ok_or(ClientError::NoHosts)?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: builder.build()?,
            base_url,
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        body: &B,
    ) -> Result<R, ClientError> {
        let url = format!("{}{path}", base.trim_end_matches('/'));
        debug!(url = %url, "Coordinator POST");
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn post_ignored<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let _: serde_json::Value = self.post(&self.base_url, path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn fetch_pending_tasks(
        &self,
        coordinator: &str,
        node_addr: &str,
        max: usize,
    ) -> Result<Vec<Task>, ClientError> {
        self.post(
            coordinator,
            "/api/v1/tasks/_pending",
            &json!({ "node": node_addr, "count": max }),
        )
        .await
    }

    async fn report_task_started(&self, task_id: i64) -> Result<(), ClientError> {
        self.post_ignored(&format!("/api/v1/tasks/{task_id}/_started"), &json!({}))
            .await
    }

    async fn report_task_stopped(&self, task_id: i64, exit_status: i32) -> Result<(), ClientError> {
        self.post_ignored(
            &format!("/api/v1/tasks/{task_id}/_stopped"),
            &json!({ "exit_status": exit_status }),
        )
        .await
    }

    async fn report_task_stats(&self, task_id: i64, stats: &TaskStats) -> Result<(), ClientError> {
        self.post_ignored(&format!("/api/v1/tasks/{task_id}/_stats"), stats)
            .await
    }

    async fn report_task_errors(
        &self,
        task_id: i64,
        errors: &[TaskError],
    ) -> Result<(), ClientError> {
        self.post_ignored(&format!("/api/v1/tasks/{task_id}/_errors"), &errors)
            .await
    }

    async fn report_expand(
        &self,
        task_id: i64,
        payload: &ScriptPayload,
    ) -> Result<(), ClientError> {
        self.post_ignored(&format!("/api/v1/tasks/{task_id}/_expand"), payload)
            .await
    }

    async fn report_batch_complete(
        &self,
        request_id: Uuid,
        result: &AnalyzeResult,
    ) -> Result<(), ClientError> {
        self.post_ignored(&format!("/api/v1/analyze/{request_id}/_complete"), result)
            .await
    }
}
