//! # Pipeline Cache
//!
//! Caches initialized processor chains keyed by (worker slot, job, pipeline)
//! so repeated tasks for the same pipeline skip re-initialization cost.
//!
//! ## Key design
//!
//! Processor instances are not required to be safe for concurrent reuse, so
//! the cache key includes the worker slot driving the batch: every slot gets
//! its own initialized chain even for the same pipeline. That trades memory
//! (duplicate chains per slot) for the invariant that no two concurrent
//! executions ever share a mutable processor instance.
//!
//! ## Lifecycle
//!
//! Values build lazily on first use; concurrent requests for the same key
//! coalesce onto a single in-flight build. A build that fails is never
//! cached. A periodic sweep evicts entries idle longer than the inactivity
//! window, and eviction always runs `teardown()` on every processor in the
//! evicted chain — processors may hold external resources only they know how
//! to release.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::processor::{Processor, ProcessorError, ProcessorResolver, ProcessorSpec};

/// Identity of one cached pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Worker slot driving the batch; slots are leased exclusively, so this
    /// component guarantees chains are never shared across concurrent work
    pub worker_slot: usize,
    pub job_id: i64,
    pub pipeline_id: i64,
}

/// An ordered, initialized processor chain plus the union of file formats
/// its processors accept
pub struct ProcessorChain {
    processors: Vec<Box<dyn Processor>>,
    supported_formats: HashSet<String>,
}

impl ProcessorChain {
    /// Whether any processor in this chain accepts the extension. An empty
    /// union means the chain accepts everything.
    pub fn is_supported_format(&self, extension: &str) -> bool {
        self.supported_formats.is_empty() || self.supported_formats.contains(extension)
    }

    pub fn supported_formats(&self) -> &HashSet<String> {
        &self.supported_formats
    }

    pub fn processors_mut(&mut self) -> &mut [Box<dyn Processor>] {
        &mut self.processors
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Best-effort teardown of every processor; one failing teardown never
    /// stops the rest
    pub fn teardown_all(&mut self) {
        for processor in &mut self.processors {
            if let Err(e) = processor.teardown() {
                warn!(processor = processor.name(), error = %e, "Failed to run teardown");
            }
        }
        self.processors.clear();
    }
}

/// Resolve and initialize a chain from its specs. Any processor failing
/// `init()` fails the whole build; processors initialized before the failure
/// are torn down so nothing leaks.
pub fn build_chain(
    specs: &[ProcessorSpec],
    resolver: &dyn ProcessorResolver,
) -> Result<ProcessorChain, ProcessorError> {
    let mut processors: Vec<Box<dyn Processor>> = Vec::with_capacity(specs.len());
    let mut supported_formats = HashSet::new();

    for spec in specs {
        let mut processor = resolver.resolve(spec).inspect_err(|_| {
            teardown_partial(&mut processors);
        })?;
        if let Err(e) = processor.init() {
            teardown_partial(&mut processors);
            return Err(e);
        }
        supported_formats.extend(processor.supported_formats());
        processors.push(processor);
    }

    Ok(ProcessorChain {
        processors,
        supported_formats,
    })
}

fn teardown_partial(processors: &mut Vec<Box<dyn Processor>>) {
    for processor in processors.iter_mut() {
        if let Err(e) = processor.teardown() {
            warn!(processor = processor.name(), error = %e, "Teardown failed during aborted build");
        }
    }
    processors.clear();
}

struct CacheSlot {
    chain: Arc<AsyncMutex<Option<ProcessorChain>>>,
    last_access: Mutex<Instant>,
}

impl CacheSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chain: Arc::new(AsyncMutex::new(None)),
            last_access: Mutex::new(Instant::now()),
        })
    }
}

/// Exclusive handle to a cached chain; the `Option` is always `Some` when
/// handed out by [`PipelineCache::get_or_build`]
pub type ChainGuard = OwnedMutexGuard<Option<ProcessorChain>>;

/// Cache of initialized processor chains with inactivity-based eviction
pub struct PipelineCache {
    entries: Mutex<HashMap<PipelineKey, Arc<CacheSlot>>>,
    inactivity_window: Duration,
    sweep_interval: Duration,
}

impl PipelineCache {
    pub fn new(inactivity_window: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inactivity_window,
            sweep_interval,
        }
    }

    /// Get the chain for a key, building it on first use. Concurrent callers
    /// for the same key block on the in-flight build instead of starting
    /// their own. A failed build is not cached; the error surfaces to the
    /// caller that triggered it.
    pub async fn get_or_build(
        &self,
        key: &PipelineKey,
        specs: &[ProcessorSpec],
        resolver: &dyn ProcessorResolver,
    ) -> Result<ChainGuard, ProcessorError> {
        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry(key.clone())
                .or_insert_with(CacheSlot::new)
                .clone()
        };

        let mut guard = slot.chain.clone().lock_owned().await;
        if guard.is_none() {
            debug!(?key, "Building processor chain");
            match build_chain(specs, resolver) {
                Ok(chain) => {
                    info!(?key, processors = chain.len(), "Initialized processor chain");
                    *guard = Some(chain);
                }
                Err(e) => {
                    // Never cache a partial or failed build
                    let mut entries = self.entries.lock();
                    if let Some(current) = entries.get(key) {
                        if Arc::ptr_eq(current, &slot) {
                            entries.remove(key);
                        }
                    }
                    return Err(e);
                }
            }
        }

        *slot.last_access.lock() = Instant::now();
        Ok(guard)
    }

    /// Evict every entry idle longer than the inactivity window, tearing
    /// down each evicted chain
    pub async fn sweep(&self) {
        let expired: Vec<(PipelineKey, Arc<CacheSlot>)> = {
            let mut entries = self.entries.lock();
            let expired_keys: Vec<PipelineKey> = entries
                .iter()
                .filter(|(_, slot)| slot.last_access.lock().elapsed() >= self.inactivity_window)
                .map(|(key, _)| key.clone())
                .collect();
            expired_keys
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|slot| (key, slot)))
                .collect()
        };

        for (key, slot) in expired {
            Self::teardown_slot(&key, slot).await;
        }
    }

    /// Evict and tear down everything, regardless of age. Used at shutdown.
    pub async fn evict_all(&self) {
        let drained: Vec<(PipelineKey, Arc<CacheSlot>)> =
            { self.entries.lock().drain().collect() };
        for (key, slot) in drained {
            Self::teardown_slot(&key, slot).await;
        }
    }

    async fn teardown_slot(key: &PipelineKey, slot: Arc<CacheSlot>) {
        let mut guard = slot.chain.lock().await;
        if let Some(mut chain) = guard.take() {
            info!(?key, "Tearing down cached pipeline");
            chain.teardown_all();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run the eviction sweep on a fixed interval until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => cache.sweep().await,
                }
            }
            cache.evict_all().await;
        })
    }
}
