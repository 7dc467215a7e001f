//! EventLog - append-only audit trail of plan and node lifecycle
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: apply-level, node-level and consistency events
//! - EventLog: thread-safe, append-only log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the apply log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since apply start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types
///
/// Uses Arc<str> for node fields to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // APPLY LEVEL
    // ═══════════════════════════════════════════
    ApplyStarted {
        node_count: usize,
        /// Unique id of this apply
        generation_id: String,
        /// xxh3 of the template source
        template_hash: String,
        token: String,
    },
    ApplyCompleted {
        outputs: Arc<Value>,
        total_duration_ms: u64,
    },
    ApplyFailed {
        error: String,
        failed_node: Option<Arc<str>>,
    },

    // ═══════════════════════════════════════════
    // NODE LEVEL
    // ═══════════════════════════════════════════
    NodeExcluded {
        node: Arc<str>,
        predicate: String,
    },
    NodeScheduled {
        node: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    /// Provisioning call about to be made with the resolved definition
    NodeStarted {
        node: Arc<str>,
        resource_id: String,
    },
    NodeResolved {
        node: Arc<str>,
        /// Published outputs; secrets appear as references only
        outputs: Arc<Value>,
        duration_ms: u64,
    },
    NodeFailed {
        node: Arc<str>,
        error: String,
        duration_ms: u64,
    },
    NodeAbandoned {
        node: Arc<str>,
        cause: String,
    },

    // ═══════════════════════════════════════════
    // PERMISSION GRANTS
    // ═══════════════════════════════════════════
    ConsistencyPolled {
        node: Arc<str>,
        attempt: u32,
        consistent: bool,
    },
}

impl EventKind {
    /// Node name if the event is node-related
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeExcluded { node, .. }
            | Self::NodeScheduled { node, .. }
            | Self::NodeStarted { node, .. }
            | Self::NodeResolved { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeAbandoned { node, .. }
            | Self::ConsistencyPolled { node, .. } => Some(node),
            Self::ApplyStarted { .. } | Self::ApplyCompleted { .. } | Self::ApplyFailed { .. } => {
                None
            }
        }
    }

    pub fn is_apply_event(&self) -> bool {
        matches!(
            self,
            Self::ApplyStarted { .. } | Self::ApplyCompleted { .. } | Self::ApplyFailed { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        // Id assignment and push under one lock so ids are monotonic in log order
        let mut events = self.events.write();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        events.push(Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        });
        id
    }

    /// Get all events (cloned - use `with_events` for zero-copy access)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Zero-copy access to events via callback
    ///
    /// Holds read lock for duration of callback - keep it short.
    pub fn with_events<T>(&self, f: impl FnOnce(&[Event]) -> T) -> T {
        f(&self.events.read())
    }

    /// Events of one node
    pub fn filter_node(&self, node: &str) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.node() == Some(node))
                .cloned()
                .collect()
        })
    }

    pub fn apply_events(&self) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.is_apply_event())
                .cloned()
                .collect()
        })
    }

    /// Id of the first event matching `pred`
    pub fn first_id(&self, pred: impl Fn(&EventKind) -> bool) -> Option<u64> {
        self.with_events(|events| events.iter().find(|e| pred(&e.kind)).map(|e| e.id))
    }

    pub fn to_json(&self) -> Value {
        self.with_events(|events| serde_json::to_value(events).unwrap_or(Value::Null))
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}
