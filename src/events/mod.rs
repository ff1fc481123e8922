//! # Event Log
//!
//! Structured diagnostic sink for ingest processing. Every per-asset and
//! per-processor diagnostic flows through here so operators can follow an
//! ingest across worker nodes. Events are emitted through `tracing` and
//! broadcast to any in-process subscribers (primarily tests and the local
//! status surface).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Severity of a diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// One diagnostic event, scoped to the ingest that produced it when known
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    /// Originating ingest, absent for ad-hoc analysis requests
    pub ingest_id: Option<i64>,
    pub severity: EventSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Diagnostic event sink shared across the analyzer and executor
#[derive(Clone)]
pub struct EventLog {
    sender: broadcast::Sender<IngestEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.sender.subscribe()
    }

    pub fn info(&self, ingest_id: Option<i64>, message: impl Into<String>) {
        self.emit(ingest_id, EventSeverity::Info, message.into());
    }

    pub fn warning(&self, ingest_id: Option<i64>, message: impl Into<String>) {
        self.emit(ingest_id, EventSeverity::Warning, message.into());
    }

    pub fn error(&self, ingest_id: Option<i64>, message: impl Into<String>) {
        self.emit(ingest_id, EventSeverity::Error, message.into());
    }

    fn emit(&self, ingest_id: Option<i64>, severity: EventSeverity, message: String) {
        match severity {
            EventSeverity::Info => info!(ingest_id = ingest_id, "📋 INGEST_EVENT: {message}"),
            EventSeverity::Warning => warn!(ingest_id = ingest_id, "⚠️ INGEST_EVENT: {message}"),
            EventSeverity::Error => error!(ingest_id = ingest_id, "❌ INGEST_EVENT: {message}"),
        }

        // A send failure only means nobody is subscribed right now
        let _ = self.sender.send(IngestEvent {
            ingest_id,
            severity,
            message,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let log = EventLog::new();
        let mut rx = log.subscribe();

        log.error(Some(42), "could not transfer asset");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.ingest_id, Some(42));
        assert_eq!(event.severity, EventSeverity::Error);
        assert!(event.message.contains("transfer"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_harmless() {
        let log = EventLog::new();
        log.info(None, "no one is listening");
    }
}
