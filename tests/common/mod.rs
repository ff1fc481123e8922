//! Shared fixtures for integration tests: in-memory storage, a scripted
//! processor, and a recording coordinator client.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use analyst_core::analyzer::cache::PipelineCache;
use analyst_core::analyzer::{AnalyzeResult, BatchAnalyzer};
use analyst_core::asset::{Asset, AssetBuilder};
use analyst_core::client::{ClientError, CoordinatorClient};
use analyst_core::events::EventLog;
use analyst_core::executor::{ScriptPayload, Task, TaskError, TaskStats};
use analyst_core::processor::{
    ProcessDisposition, Processor, ProcessorResolver, StaticProcessorRegistry,
};
use analyst_core::storage::{
    AssetStore, BulkItemOutcome, LocalObjectStore, ObjectStore, StorageError, TransferService,
};

/// Processor whose per-asset behavior is a closure supplied by the test
pub struct ScriptedProcessor {
    name: String,
    formats: HashSet<String>,
    behavior: Arc<dyn Fn(&mut AssetBuilder) -> ProcessDisposition + Send + Sync>,
    processed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProcessor {
    pub fn new(
        name: &str,
        formats: &[&str],
        processed: Arc<Mutex<Vec<String>>>,
        behavior: impl Fn(&mut AssetBuilder) -> ProcessDisposition + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            formats: formats.iter().map(|f| f.to_string()).collect(),
            behavior: Arc::new(behavior),
            processed,
        }
    }
}

impl Processor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, asset: &mut AssetBuilder) -> ProcessDisposition {
        self.processed
            .lock()
            .push(asset.path().to_string_lossy().into_owned());
        (self.behavior)(asset)
    }

    fn supported_formats(&self) -> HashSet<String> {
        self.formats.clone()
    }
}

/// In-memory asset store keyed by absolute path
#[derive(Default)]
pub struct MemoryAssetStore {
    docs: Mutex<HashMap<String, Asset>>,
    upsert_calls: AtomicUsize,
}

impl MemoryAssetStore {
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self, path: &str) -> Option<Asset> {
        self.docs.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn get_by_path(&self, path: &str) -> Result<Option<Asset>, StorageError> {
        Ok(self.docs.lock().get(path).cloned())
    }

    async fn bulk_upsert(
        &self,
        assets: &[AssetBuilder],
    ) -> Result<Vec<BulkItemOutcome>, StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock();
        Ok(assets
            .iter()
            .map(|asset| {
                let key = asset.path().to_string_lossy().into_owned();
                let outcome = if docs.contains_key(&key) {
                    BulkItemOutcome::Updated
                } else {
                    BulkItemOutcome::Created
                };
                docs.insert(key, asset.snapshot());
                outcome
            })
            .collect())
    }
}

/// Transfer service backed by a fixed uri-to-bytes map
#[derive(Default)]
pub struct MapTransfer {
    blobs: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
}

impl MapTransfer {
    pub fn with(mut self, uri: &str, bytes: &[u8]) -> Self {
        self.blobs.insert(uri.to_string(), bytes.to_vec());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferService for MapTransfer {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, StorageError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .get(uri)
            .cloned()
            .ok_or_else(|| StorageError::Transfer {
                uri: uri.to_string(),
                message: "source not found".to_string(),
            })
    }
}

/// Coordinator client that records every report it receives
#[derive(Default)]
pub struct RecordingClient {
    pub calls: Mutex<Vec<String>>,
    pub completions: Mutex<Vec<(Uuid, AnalyzeResult)>>,
    pub pending: Mutex<Vec<Task>>,
}

impl RecordingClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn push_pending(&self, task: Task) {
        self.pending.lock().push(task);
    }

    /// Poll until a recorded call starts with the given prefix
    pub async fn wait_for_call(&self, prefix: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(call) = self
                    .calls
                    .lock()
                    .iter()
                    .find(|call| call.starts_with(prefix))
                    .cloned()
                {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for call '{prefix}'"))
    }
}

#[async_trait]
impl CoordinatorClient for RecordingClient {
    async fn fetch_pending_tasks(
        &self,
        _coordinator: &str,
        _node_addr: &str,
        max: usize,
    ) -> Result<Vec<Task>, ClientError> {
        let mut pending = self.pending.lock();
        let take = pending.len().min(max);
        Ok(pending.drain(..take).collect())
    }

    async fn report_task_started(&self, task_id: i64) -> Result<(), ClientError> {
        self.calls.lock().push(format!("started:{task_id}"));
        Ok(())
    }

    async fn report_task_stopped(&self, task_id: i64, exit_status: i32) -> Result<(), ClientError> {
        self.calls
            .lock()
            .push(format!("stopped:{task_id}:{exit_status}"));
        Ok(())
    }

    async fn report_task_stats(&self, task_id: i64, stats: &TaskStats) -> Result<(), ClientError> {
        self.calls.lock().push(format!(
            "stats:{task_id}:{}:{}:{}",
            stats.success_count, stats.warning_count, stats.error_count
        ));
        Ok(())
    }

    async fn report_task_errors(
        &self,
        task_id: i64,
        errors: &[TaskError],
    ) -> Result<(), ClientError> {
        self.calls
            .lock()
            .push(format!("errors:{task_id}:{}", errors.len()));
        Ok(())
    }

    async fn report_expand(
        &self,
        task_id: i64,
        payload: &ScriptPayload,
    ) -> Result<(), ClientError> {
        self.calls.lock().push(format!(
            "expand:{task_id}:{}",
            payload.name.as_deref().unwrap_or("unnamed")
        ));
        Ok(())
    }

    async fn report_batch_complete(
        &self,
        request_id: Uuid,
        result: &AnalyzeResult,
    ) -> Result<(), ClientError> {
        self.calls.lock().push(format!("complete:{request_id}"));
        self.completions.lock().push((request_id, result.clone()));
        Ok(())
    }
}

/// A ready-to-run analyzer wired over temp-dir storage
pub struct AnalyzerFixture {
    pub analyzer: Arc<BatchAnalyzer>,
    pub store: Arc<MemoryAssetStore>,
    pub cache: Arc<PipelineCache>,
    pub events: EventLog,
    pub transfer: Arc<MapTransfer>,
    pub objects: Arc<LocalObjectStore>,
    pub dir: TempDir,
}

impl AnalyzerFixture {
    pub fn new(registry: StaticProcessorRegistry) -> Self {
        Self::with_transfer(registry, MapTransfer::default())
    }

    pub fn with_transfer(registry: StaticProcessorRegistry, transfer: MapTransfer) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryAssetStore::default());
        let cache = Arc::new(PipelineCache::new(
            Duration::from_secs(600),
            Duration::from_secs(60),
        ));
        let events = EventLog::new();
        let transfer = Arc::new(transfer);
        let objects = Arc::new(LocalObjectStore::new(dir.path().join("objects")));
        let analyzer = Arc::new(BatchAnalyzer::new(
            Arc::clone(&cache),
            Arc::new(registry) as Arc<dyn ProcessorResolver>,
            Arc::clone(&store) as Arc<dyn AssetStore>,
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
            Arc::clone(&transfer) as Arc<dyn TransferService>,
            events.clone(),
        ));
        Self {
            analyzer,
            store,
            cache,
            events,
            transfer,
            objects,
            dir,
        }
    }

    /// Create a file under the fixture dir and return its absolute path as a
    /// string
    pub fn touch(&self, name: &str) -> String {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, b"fixture bytes").expect("write fixture");
        path.to_string_lossy().into_owned()
    }
}

/// Registry with one pass-through processor registered under `id`
pub fn noop_registry(id: &str, formats: &'static [&'static str]) -> StaticProcessorRegistry {
    let mut registry = StaticProcessorRegistry::new();
    let name = id.to_string();
    registry.register(id, move |_args| {
        Ok(Box::new(ScriptedProcessor::new(
            &name,
            formats,
            Arc::new(Mutex::new(Vec::new())),
            |_asset| ProcessDisposition::Continue,
        )))
    });
    registry
}

pub fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}
