//! # Batch Analyzer
//!
//! The batch analysis engine: takes an [`AnalyzeRequest`] naming assets and a
//! processor chain, runs every asset through the chain, and persists the
//! surviving documents through the asset store.
//!
//! ## Architecture
//!
//! A batch is driven by one exclusively leased worker slot, so the engine can
//! hand each processor `&mut self` access without further locking. Chains are
//! cached per (slot, job, pipeline) in the [`cache::PipelineCache`]; requests
//! without a pipeline identity get an ad-hoc chain that is torn down when the
//! batch ends.
//!
//! ## Error containment
//!
//! A failure on one asset never stops the batch. Resolution failures and
//! processor aborts are counted and logged against that asset alone; the
//! queue moves on. Only pipeline initialization, storage transport failures,
//! and cancellation abort the whole request.

pub mod cache;
pub mod persist;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::asset::{local_path_of, Asset, AssetBuilder, AssetRef};
use crate::events::{EventLog, EventSeverity};
use crate::processor::{ProcessDisposition, ProcessorResolver, ProcessorSpec};
use crate::storage::{content_key, AssetStore, ObjectStore, StorageError, TransferService};

use cache::{build_chain, ChainGuard, PipelineCache, PipelineKey, ProcessorChain};

/// Failures that abort a whole analysis request
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("pipeline init failed: {0}")]
    PipelineInit(#[from] crate::processor::ProcessorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("analysis cancelled")]
    Cancelled,
}

/// One batch analysis request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub assets: Vec<AssetRef>,
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    /// Originating ingest. When present, diagnostics go to the event log
    /// instead of the response body.
    #[serde(default)]
    pub ingest_id: Option<i64>,
    /// Run the chain but skip persistence
    #[serde(default)]
    pub dry_run: bool,
    /// Include full asset snapshots in the result
    #[serde(default)]
    pub return_assets: bool,
}

impl AnalyzeRequest {
    pub fn new(assets: Vec<AssetRef>, processors: Vec<ProcessorSpec>) -> Self {
        Self {
            id: Uuid::new_v4(),
            assets,
            processors,
            job_id: None,
            pipeline_id: None,
            ingest_id: None,
            dry_run: false,
            return_assets: false,
        }
    }

    /// The cacheable pipeline identity, present only when both the job and
    /// pipeline are known
    pub fn pipeline_identity(&self) -> Option<(i64, i64)> {
        Some((self.job_id?, self.pipeline_id?))
    }
}

/// Accumulated counters and diagnostics for one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeResult {
    /// Assets the engine attempted, after format filtering
    pub tried: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
    pub warnings: u64,
    /// Persistence retry rounds taken
    pub retries: u64,
    /// Per-asset diagnostics, populated only for requests without an ingest
    #[serde(default)]
    pub logs: Vec<String>,
    /// Snapshots of the processed assets, when the request asked for them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<Asset>>,
}

impl AnalyzeResult {
    /// Fold another batch's counters and diagnostics into this one
    pub fn add(&mut self, other: AnalyzeResult) {
        self.tried += other.tried;
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.retries += other.retries;
        self.logs.extend(other.logs);
        if let Some(incoming) = other.assets {
            self.assets.get_or_insert_with(Vec::new).extend(incoming);
        }
    }
}

enum ChainHandle {
    Cached(ChainGuard),
    AdHoc(ProcessorChain),
}

impl ChainHandle {
    fn chain_mut(&mut self) -> &mut ProcessorChain {
        match self {
            // the cache only hands out guards over populated slots
            ChainHandle::Cached(guard) => guard.as_mut().expect("cached chain is populated"),
            ChainHandle::AdHoc(chain) => chain,
        }
    }
}

/// The batch analysis engine
pub struct BatchAnalyzer {
    cache: Arc<PipelineCache>,
    resolver: Arc<dyn ProcessorResolver>,
    asset_store: Arc<dyn AssetStore>,
    object_store: Arc<dyn ObjectStore>,
    transfer: Arc<dyn TransferService>,
    events: EventLog,
}

impl BatchAnalyzer {
    pub fn new(
        cache: Arc<PipelineCache>,
        resolver: Arc<dyn ProcessorResolver>,
        asset_store: Arc<dyn AssetStore>,
        object_store: Arc<dyn ObjectStore>,
        transfer: Arc<dyn TransferService>,
        events: EventLog,
    ) -> Self {
        Self {
            cache,
            resolver,
            asset_store,
            object_store,
            transfer,
            events,
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Run one batch on the given worker slot. The caller must hold the slot
    /// lease for the duration of the call.
    #[instrument(skip(self, request, cancel), fields(request_id = %request.id, assets = request.assets.len()))]
    pub async fn analyze(
        &self,
        worker_slot: usize,
        request: &AnalyzeRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalyzeResult, AnalyzeError> {
        let mut handle = self.acquire_chain(worker_slot, request).await?;
        let outcome = self.run_batch(handle.chain_mut(), request, cancel).await;
        if let ChainHandle::AdHoc(chain) = &mut handle {
            chain.teardown_all();
        }
        outcome
    }

    async fn acquire_chain(
        &self,
        worker_slot: usize,
        request: &AnalyzeRequest,
    ) -> Result<ChainHandle, AnalyzeError> {
        match request.pipeline_identity() {
            Some((job_id, pipeline_id)) => {
                let key = PipelineKey {
                    worker_slot,
                    job_id,
                    pipeline_id,
                };
                let guard = self
                    .cache
                    .get_or_build(&key, &request.processors, self.resolver.as_ref())
                    .await?;
                Ok(ChainHandle::Cached(guard))
            }
            None => {
                debug!("Request has no pipeline identity, building ad-hoc chain");
                Ok(ChainHandle::AdHoc(build_chain(
                    &request.processors,
                    self.resolver.as_ref(),
                )?))
            }
        }
    }

    async fn run_batch(
        &self,
        chain: &mut ProcessorChain,
        request: &AnalyzeRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalyzeResult, AnalyzeError> {
        let mut result = AnalyzeResult::default();
        let mut completed: Vec<AssetBuilder> = Vec::new();
        let mut queue: VecDeque<AssetRef> = request.assets.iter().cloned().collect();

        while let Some(entry) = queue.pop_front() {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                info!(request_id = %request.id, "Batch cancelled between assets");
                return Err(AnalyzeError::Cancelled);
            }

            let extension = entry.extension();
            if !chain.is_supported_format(&extension) {
                // Not a failure; the asset simply isn't this chain's concern
                debug!(uri = %entry.uri, "No processor accepts this format, skipping");
                continue;
            }
            result.tried += 1;

            let path = match self.materialize(&entry).await {
                Ok(path) => path,
                Err(message) => {
                    result.errors += 1;
                    self.record_diagnostic(
                        request,
                        &mut result,
                        EventSeverity::Error,
                        format!("Unable to resolve asset '{}': {message}", entry.uri),
                    );
                    continue;
                }
            };

            let mut builder = AssetBuilder::new(&path);
            if entry.remote {
                builder.set_remote_source(&entry.uri);
            }
            for (key, value) in &entry.attrs {
                builder.apply_entry_attr(key, value.clone());
            }
            match self
                .asset_store
                .get_by_path(&path.to_string_lossy())
                .await
            {
                Ok(previous) => builder.set_previous_version(previous),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Previous-version lookup failed")
                }
            }
            let inherited_links = builder
                .previous_version()
                .and_then(|previous| previous.document.get("links").cloned());
            if let Some(links) = inherited_links {
                // stored parent links survive re-analysis unless the request
                // sets its own
                if builder.get_attr("links").is_none() {
                    builder.set_attr("links", links);
                }
            }

            let survived = self.run_chain(chain, request, &mut result, &mut builder, &extension);
            builder.close();
            if builder.remote_source().is_some() {
                // the materialized copy is per-batch scratch; remove it on
                // every exit path, aborted assets included
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "Materialized copy already removed");
                }
            }
            if !survived {
                continue;
            }

            for derived in builder.take_derived() {
                debug!(parent = builder.id(), uri = %derived, "Queueing derived asset");
                queue.push_back(
                    AssetRef::local(derived).with_attr("@links.parents", json!(builder.id())),
                );
            }
            completed.push(builder);
        }

        if request.dry_run {
            debug!(request_id = %request.id, "Dry run, skipping persistence");
        } else {
            let log_mark = result.logs.len();
            persist::persist_batch(self.asset_store.as_ref(), &mut completed, &mut result)
                .await?;
            for line in &result.logs[log_mark..] {
                self.events.error(request.ingest_id, line.clone());
            }
            if request.ingest_id.is_some() {
                result.logs.truncate(log_mark);
            }
        }

        if request.return_assets {
            result.assets = Some(completed.iter().map(AssetBuilder::snapshot).collect());
        }

        info!(
            request_id = %request.id,
            tried = result.tried,
            created = result.created,
            updated = result.updated,
            errors = result.errors,
            warnings = result.warnings,
            "✅ Batch complete"
        );
        Ok(result)
    }

    /// Run the chain over one asset. Returns whether the asset survives into
    /// the output batch.
    fn run_chain(
        &self,
        chain: &mut ProcessorChain,
        request: &AnalyzeRequest,
        result: &mut AnalyzeResult,
        builder: &mut AssetBuilder,
        extension: &str,
    ) -> bool {
        for processor in chain.processors_mut() {
            if !processor.is_supported_format(extension) {
                continue;
            }
            let name = processor.name().to_string();
            match processor.process(builder) {
                ProcessDisposition::Continue => {
                    builder.add_to_attr("imports.processors", json!(name));
                }
                ProcessDisposition::Skip(reason) => {
                    debug!(asset = builder.id(), processor = %name, "Asset skipped: {reason}");
                    return false;
                }
                ProcessDisposition::Abort(reason) => {
                    result.errors += 1;
                    self.record_diagnostic(
                        request,
                        result,
                        EventSeverity::Error,
                        format!(
                            "Processor '{name}' failed on '{}': {reason}",
                            builder.path().display()
                        ),
                    );
                    return false;
                }
                ProcessDisposition::Warn(reason) => {
                    result.warnings += 1;
                    self.record_diagnostic(
                        request,
                        result,
                        EventSeverity::Warning,
                        format!(
                            "Processor '{name}' warned on '{}': {reason}",
                            builder.path().display()
                        ),
                    );
                }
            }
        }
        true
    }

    /// Resolve an entry to a local filesystem path, fetching remote bytes
    /// into the object store when they are not already materialized
    async fn materialize(&self, entry: &AssetRef) -> Result<PathBuf, String> {
        if entry.remote {
            let key = content_key(&entry.uri);
            let present = self
                .object_store
                .exists(&key)
                .await
                .map_err(|e| e.to_string())?;
            if !present {
                let bytes = self
                    .transfer
                    .fetch(&entry.uri)
                    .await
                    .map_err(|e| e.to_string())?;
                self.object_store
                    .store(&key, bytes)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Ok(self.object_store.local_path(&key))
        } else {
            let path = local_path_of(&entry.uri);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => Ok(path),
                Ok(false) => Err("file does not exist".to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
    }

    /// Route a per-asset diagnostic: always to the event log, and into the
    /// response body only for requests without an ingest
    fn record_diagnostic(
        &self,
        request: &AnalyzeRequest,
        result: &mut AnalyzeResult,
        severity: EventSeverity,
        message: String,
    ) {
        match severity {
            EventSeverity::Warning => self.events.warning(request.ingest_id, message.clone()),
            _ => self.events.error(request.ingest_id, message.clone()),
        }
        if request.ingest_id.is_none() {
            result.logs.push(message);
        }
    }
}
