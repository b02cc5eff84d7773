//! Structured loader events and the sinks that receive them.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identifier::PluginIdentifier;

/// Kind of loader event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Loaded,
    Unloaded,
    Invoked,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Loaded => "loaded",
            EventKind::Unloaded => "unloaded",
            EventKind::Invoked => "invoked",
            EventKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Event emitted by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderEvent {
    pub event: EventKind,
    pub identifier: PluginIdentifier,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub detail: String,
}

impl LoaderEvent {
    pub fn new(event: EventKind, identifier: PluginIdentifier, detail: impl Into<String>) -> Self {
        Self {
            event,
            identifier,
            timestamp: chrono::Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Receives loader events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LoaderEvent);
}

impl<F> EventSink for F
where
    F: Fn(LoaderEvent) + Send + Sync,
{
    fn emit(&self, event: LoaderEvent) {
        self(event)
    }
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LoaderEvent) {
        match event.event {
            EventKind::Error => tracing::warn!(
                event = %event.event,
                identifier = %event.identifier,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %event.detail,
                "plugin error"
            ),
            EventKind::Invoked => tracing::debug!(
                event = %event.event,
                identifier = %event.identifier,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %event.detail,
                "plugin invoked"
            ),
            _ => tracing::info!(
                event = %event.event,
                identifier = %event.identifier,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %event.detail,
                "plugin {}",
                event.event
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LoaderEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoaderEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind, in emission order.
    pub fn of_kind(&self, kind: EventKind) -> Vec<LoaderEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: LoaderEvent) {
        self.events.lock().push(event);
    }
}
