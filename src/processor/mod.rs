//! # Processor Contract
//!
//! The uniform contract every content processor implements, plus the resolver
//! that turns a configured processor identifier into a runnable instance.
//!
//! ## Architecture
//!
//! Processors are opaque processing steps (metadata extraction, proxy
//! generation, classification) chained into pipelines. Each instance is owned
//! by exactly one worker slot at a time, so implementations do not need to be
//! thread-safe; they may hold file handles, model memory, or other external
//! resources between `init()` and `teardown()`.
//!
//! Per-asset control flow is a closed result type rather than error
//! downcasting: a processor reports [`ProcessDisposition::Skip`] to drop the
//! asset quietly, [`ProcessDisposition::Abort`] to invalidate all further
//! processing of the asset, or [`ProcessDisposition::Warn`] to record a
//! warning and let the rest of the chain run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::info;

use crate::asset::AssetBuilder;

/// Errors raised while resolving or managing processor instances
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("unknown processor '{0}'")]
    UnknownProcessor(String),

    #[error("processor '{processor}' construction failed: {message}")]
    Construction { processor: String, message: String },

    #[error("processor '{processor}' init failed: {message}")]
    Init { processor: String, message: String },

    #[error("processor '{processor}' teardown failed: {message}")]
    Teardown { processor: String, message: String },
}

/// Outcome of running one processor over one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessDisposition {
    /// Processing succeeded; continue with the next processor in the chain
    Continue,
    /// Abandon this asset quietly; it is excluded from the output batch and
    /// nothing is counted against the request
    Skip(String),
    /// Abort the remaining chain for this asset and count it as an error
    Abort(String),
    /// Record a warning and continue with the next processor in the chain
    Warn(String),
}

/// One content-processing step in a pipeline
pub trait Processor: Send {
    /// Stable identifier used in diagnostics and import bookkeeping
    fn name(&self) -> &str;

    /// Acquire whatever external resources the processor needs. Called once
    /// before the instance joins a chain; a failure here fails the whole
    /// chain build.
    fn init(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Run this step over one asset.
    fn process(&mut self, asset: &mut AssetBuilder) -> ProcessDisposition;

    /// Release resources acquired in `init()`. Called exactly once when the
    /// owning chain is discarded.
    fn teardown(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// File extensions this processor accepts. Empty means it accepts
    /// everything.
    fn supported_formats(&self) -> HashSet<String> {
        HashSet::new()
    }
}

impl dyn Processor {
    /// Whether this processor accepts the given lowercase extension
    pub fn is_supported_format(&self, extension: &str) -> bool {
        let formats = self.supported_formats();
        formats.is_empty() || formats.contains(extension)
    }
}

/// Configured reference to a processor: identifier plus its argument map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub id: String,
    #[serde(default)]
    pub args: Value,
}

impl ProcessorSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: Value::Null,
        }
    }

    pub fn with_args(id: impl Into<String>, args: Value) -> Self {
        Self { id: id.into(), args }
    }
}

/// Turns a [`ProcessorSpec`] into a runnable processor instance
pub trait ProcessorResolver: Send + Sync {
    fn resolve(&self, spec: &ProcessorSpec) -> Result<Box<dyn Processor>, ProcessorError>;
}

type ProcessorCtor =
    Box<dyn Fn(&Value) -> Result<Box<dyn Processor>, ProcessorError> + Send + Sync>;

/// Registration-time capability table mapping processor identifiers to
/// constructors. Populated once at startup; resolution is a plain lookup, so
/// an unknown identifier fails with a named error instead of a load attempt.
#[derive(Default)]
pub struct StaticProcessorRegistry {
    constructors: HashMap<String, ProcessorCtor>,
}

impl StaticProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for the given processor identifier. Replaces
    /// any previous registration for the same id.
    pub fn register<F>(&mut self, id: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Processor>, ProcessorError> + Send + Sync + 'static,
    {
        let id = id.into();
        info!(processor = %id, "Registering processor constructor");
        self.constructors.insert(id, Box::new(ctor));
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl ProcessorResolver for StaticProcessorRegistry {
    fn resolve(&self, spec: &ProcessorSpec) -> Result<Box<dyn Processor>, ProcessorError> {
        let ctor = self
            .constructors
            .get(&spec.id)
            .ok_or_else(|| ProcessorError::UnknownProcessor(spec.id.clone()))?;
        ctor(&spec.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProcessor;

    impl Processor for NoopProcessor {
        fn name(&self) -> &str {
            "noop"
        }

        fn process(&mut self, _asset: &mut AssetBuilder) -> ProcessDisposition {
            ProcessDisposition::Continue
        }
    }

    #[test]
    fn test_resolve_registered_processor() {
        let mut registry = StaticProcessorRegistry::new();
        registry.register("noop", |_args| Ok(Box::new(NoopProcessor)));

        let processor = registry.resolve(&ProcessorSpec::new("noop")).unwrap();
        assert_eq!(processor.name(), "noop");
    }

    #[test]
    fn test_unknown_processor_is_a_named_error() {
        let registry = StaticProcessorRegistry::new();
        let err = registry
            .resolve(&ProcessorSpec::new("does-not-exist"))
            .err()
            .unwrap();
        assert!(matches!(err, ProcessorError::UnknownProcessor(_)));
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn test_empty_format_set_accepts_everything() {
        let processor: Box<dyn Processor> = Box::new(NoopProcessor);
        assert!(processor.is_supported_format("jpg"));
        assert!(processor.is_supported_format("pdf"));
    }
}
