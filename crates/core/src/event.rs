//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the system.
//! Other components can subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A pipeline turn reached a terminal outcome
    TurnCompleted {
        turn_id: String,
        channel: String,
        namespace: Option<String>,
        outcome: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Retrieval answered with less than the primary tier
    RetrievalDegraded {
        namespace: String,
        used_fallback: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A detached extraction task finished (appended or not)
    ExtractionFinished {
        turn_id: String,
        namespace: String,
        appended: bool,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A maintenance cycle ended
    MaintenanceCycle {
        namespace: String,
        outcome: String, // "completed", "failed", "skipped"
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A channel was re-bound to a new identity
    IdentitySwapped {
        channel: String,
        old_namespace: String,
        new_namespace: String,
        archive_path: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
