//! # Analyst Core
//!
//! Task execution engine for a worker node in a distributed media-analysis
//! platform. The node leases tasks from a coordinator tier, runs each task's
//! batch of assets through a configured processor chain, and persists the
//! resulting documents while reporting lifecycle events back.
//!
//! ## Architecture
//!
//! - **processor**: the uniform processor contract and the static registry
//!   that resolves configured processor ids into runnable instances
//! - **asset**: the mutable asset document processors write into
//! - **analyzer**: the batch engine, its per-slot pipeline cache, and the
//!   persistence layer with recoverable-field retry
//! - **executor**: the task registry, script runner, and process manager
//!   that owns admission, concurrency, kill handling, and reporting
//! - **service**: worker slot pool and the request-facing analysis service
//! - **client**: HTTP client for the coordinator tier
//!
//! ## Example
//!
//! ```no_run
//! use analyst_core::analyzer::cache::PipelineCache;
//! use analyst_core::config::ConfigManager;
//! use analyst_core::processor::StaticProcessorRegistry;
//! use std::sync::Arc;
//!
//! # fn main() -> analyst_core::Result<()> {
//! analyst_core::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! let cache = Arc::new(PipelineCache::new(
//!     config.cache_inactivity_window(),
//!     config.cache_sweep_interval(),
//! ));
//! let registry = StaticProcessorRegistry::new();
//! # let _ = (cache, registry);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod asset;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod processor;
pub mod service;
pub mod storage;

pub use analyzer::{AnalyzeRequest, AnalyzeResult, BatchAnalyzer};
pub use asset::{Asset, AssetBuilder, AssetRef};
pub use client::{CoordinatorClient, HttpCoordinatorClient};
pub use config::{AnalystConfig, ConfigManager};
pub use error::{AnalystError, Result};
pub use events::EventLog;
pub use executor::{ProcessManager, Task, TaskRegistry};
pub use processor::{ProcessDisposition, Processor, ProcessorSpec, StaticProcessorRegistry};
pub use service::{AnalyzeService, SlotPool};
