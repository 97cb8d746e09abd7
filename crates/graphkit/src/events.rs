//! Event emission (spec §9): "every component exposes a subscription
//! interface delivering structured event records; consumers pull via a
//! cancellable channel, not via callback registration."
//!
//! Grounded on the teacher's `ApprovalChannel` (`dashflow/src/approval.rs`),
//! which wraps a `tokio::sync::mpsc` pair behind a named constructor rather
//! than exposing raw channel ends. We use `broadcast` instead of `mpsc`
//! because more than one consumer may subscribe to the same stream (a CLI
//! progress bar and a metrics sink, say).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a structured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured event (spec §4.11): `{component, level, message, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub component: String,
    pub level: Level,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(component: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            level,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Named event kinds referenced by spec §6 ("Events: pipeline:started,
/// pipeline:error, parse:error, worker:error, metrics:updated,
/// alert:triggered, batch:completed") plus the store-level create/update
/// events from §4.3/§4.4.
pub mod kind {
    pub const ENTITY_CREATED: &str = "entity:created";
    pub const ENTITY_UPDATED: &str = "entity:updated";
    pub const RELATIONSHIP_MERGED: &str = "relationship:merged";
    pub const PIPELINE_STARTED: &str = "pipeline:started";
    pub const PIPELINE_ERROR: &str = "pipeline:error";
    pub const PARSE_ERROR: &str = "parse:error";
    pub const WORKER_ERROR: &str = "worker:error";
    pub const METRICS_UPDATED: &str = "metrics:updated";
    pub const ALERT_TRIGGERED: &str = "alert:triggered";
    pub const BATCH_COMPLETED: &str = "batch:completed";
}

/// A cancellable, cloneable event bus. Cloning shares the same underlying
/// broadcast channel, so every component that takes a handle observes the
/// same stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Silently drops it if there are no subscribers,
    /// matching `broadcast`'s semantics.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe for a cancellable receive loop.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
