//! Asynchronous event bus.
//!
//! Faults detected outside an operator command are queued here instead of
//! interrupting the running reply. The telemetry writer tags its next line
//! with `AS0` while anything is pending; `return_event()` (invoked at the
//! start of every operator command) drains and prints them.

use std::sync::Arc;

use alma_common::{EventKind, NodeId};
use parking_lot::Mutex;
use tracing::warn;

/// Capacity of the ring; beyond it new events are dropped.
const EVENT_BUFFER_SIZE: usize = 64;

/// One queued asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub node: NodeId,
    /// Expected in the current robot state (e.g. a travel limit while
    /// released); reported but not treated as a fault.
    pub escalated: bool,
    pub detail: Option<String>,
}

/// Shared, deduplicating event queue.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event unless one with the same `(kind, node)` is already
    /// pending.
    pub fn add(&self, kind: EventKind, node: NodeId, escalated: bool, detail: Option<String>) {
        let mut events = self.inner.lock();
        if events.iter().any(|e| e.kind == kind && e.node == node) {
            return;
        }
        if events.len() >= EVENT_BUFFER_SIZE {
            warn!(?kind, node, "event buffer full, dropping");
            return;
        }
        events.push(Event {
            kind,
            node,
            escalated,
            detail,
        });
    }

    /// Anything queued since the last drain?
    pub fn pending(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    /// Take every queued event. A second drain with nothing new returns
    /// an empty vector.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_by_kind_and_node() {
        let bus = EventBus::new();
        bus.add(EventKind::FileError, 119, false, Some("linea 3".into()));
        bus.add(EventKind::FileError, 119, false, Some("linea 4".into()));
        bus.add(EventKind::FileError, 120, false, None);
        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].detail.as_deref(), Some("linea 3"));
    }

    #[test]
    fn drain_is_idempotent() {
        let bus = EventBus::new();
        bus.add(EventKind::QuickStop, 119, false, None);
        assert!(bus.pending());
        assert_eq!(bus.drain().len(), 1);
        assert!(!bus.pending());
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn overflow_drops_new_events() {
        let bus = EventBus::new();
        for node in 0..EVENT_BUFFER_SIZE as u8 {
            bus.add(EventKind::InternalError, node, false, None);
        }
        bus.add(EventKind::QuickStop, 200, false, None);
        let drained = bus.drain();
        assert_eq!(drained.len(), EVENT_BUFFER_SIZE);
        assert!(!drained.iter().any(|e| e.kind == EventKind::QuickStop));
    }
}
