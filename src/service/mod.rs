//! # Analysis Service
//!
//! The request-facing surface over the batch analyzer: a bounded pool of
//! worker slots, synchronous analysis for interactive callers, and detached
//! analysis with a guaranteed completion callback.
//!
//! ## Worker slots
//!
//! Slot identity is what keys the pipeline cache, so slots are leased
//! exclusively: at most one batch runs per slot at a time, and a returned
//! slot id can be handed to the next batch, which then reuses that slot's
//! cached chains.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analyzer::{AnalyzeError, AnalyzeRequest, AnalyzeResult, BatchAnalyzer};
use crate::client::CoordinatorClient;

/// Fixed-size pool of exclusively leased worker slot identities
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    free: parking_lot::Mutex<Vec<usize>>,
}

impl SlotPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            free: parking_lot::Mutex::new((0..size).rev().collect()),
        })
    }

    /// Lease a slot, waiting until one frees up. The slot returns to the
    /// pool when the lease drops.
    pub async fn lease(self: &Arc<Self>) -> SlotLease {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("slot pool semaphore is never closed");
        let id = self
            .free
            .lock()
            .pop()
            .expect("permit guarantees a free slot");
        SlotLease {
            id,
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Exclusive lease on one worker slot
pub struct SlotLease {
    id: usize,
    pool: Arc<SlotPool>,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.id);
    }
}

/// Request-facing analysis service
pub struct AnalyzeService {
    analyzer: Arc<BatchAnalyzer>,
    slots: Arc<SlotPool>,
    client: Arc<dyn CoordinatorClient>,
}

impl AnalyzeService {
    pub fn new(
        analyzer: Arc<BatchAnalyzer>,
        slots: Arc<SlotPool>,
        client: Arc<dyn CoordinatorClient>,
    ) -> Self {
        Self {
            analyzer,
            slots,
            client,
        }
    }

    /// Run a batch synchronously on a leased slot
    pub async fn analyze(
        &self,
        request: &AnalyzeRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalyzeResult, AnalyzeError> {
        let slot = self.slots.lease().await;
        self.analyzer.analyze(slot.id(), request, cancel).await
    }

    /// Run a batch detached from the caller. Exactly one completion report
    /// reaches the coordinator whether the batch succeeds, fails, or panics;
    /// the inner task boundary converts a panic into a failure report instead
    /// of a silent loss.
    pub fn async_analyze(&self, request: AnalyzeRequest) -> JoinHandle<()> {
        let analyzer = Arc::clone(&self.analyzer);
        let slots = Arc::clone(&self.slots);
        let client = Arc::clone(&self.client);
        let request_id = request.id;
        let asset_count = request.assets.len() as u64;

        tokio::spawn(async move {
            let inner = tokio::spawn(async move {
                let slot = slots.lease().await;
                analyzer.analyze(slot.id(), &request, None).await
            });

            let result = match inner.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!(request_id = %request_id, error = %e, "❌ Detached batch failed");
                    failure_result(asset_count, e.to_string())
                }
                Err(join_error) => {
                    error!(request_id = %request_id, error = %join_error, "❌ Detached batch panicked");
                    failure_result(asset_count, format!("analysis aborted: {join_error}"))
                }
            };

            info!(request_id = %request_id, "Reporting batch completion");
            if let Err(e) = client.report_batch_complete(request_id, &result).await {
                crate::logging::log_error(
                    "analyze_service",
                    "report_batch_complete",
                    &e.to_string(),
                    Some(&request_id.to_string()),
                );
            }
        })
    }
}

fn failure_result(asset_count: u64, message: String) -> AnalyzeResult {
    AnalyzeResult {
        errors: asset_count,
        logs: vec![message],
        ..Default::default()
    }
}
