//! The tube manager's event dispatcher: a fixed set of named events
//! (`loopstart`, `running`, `data`, `close`, `add`, `remove`), each with zero
//! or more registered callbacks run in registration order on the loop
//! thread.
//!
//! This is a named-event registry rather than the process-wide
//! breadth-first dispatch the original builds on top of its generic event
//! library; a SPUD manager only ever needs these six events, so a
//! `HashMap<EventKind, Vec<Callback>>` keeps the single-threaded,
//! in-registration-order delivery contract without dragging in a
//! general-purpose pub/sub layer.

use std::collections::HashMap;

use crate::id::TubeId;
use crate::wire::cbor::Value;

/// The fixed set of events a [`crate::manager::TubeManager`] can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The manager's loop has started processing.
    LoopStart,
    /// A tube transitioned into RUNNING.
    Running,
    /// A DATA packet was received on a RUNNING tube.
    Data,
    /// A tube transitioned out of RUNNING back to UNKNOWN.
    Close,
    /// A tube was added to the manager's table.
    Add,
    /// A tube was removed from the manager's table.
    Remove,
}

impl EventKind {
    /// Parse one of the six event names used in `bind_event`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "loopstart" => EventKind::LoopStart,
            "running" => EventKind::Running,
            "data" => EventKind::Data,
            "close" => EventKind::Close,
            "add" => EventKind::Add,
            "remove" => EventKind::Remove,
            _ => return None,
        })
    }
}

/// The payload delivered to a callback when an event fires. Not every event
/// carries a tube id (`loopstart` fires with `None`); only `data` carries a
/// CBOR payload, reflecting the DATA packet that triggered it.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub tube_id: Option<TubeId>,
    pub payload: Option<Value>,
}

impl Event {
    /// Build an event with no payload, the common case for every kind but
    /// `data`.
    pub fn new(kind: EventKind, tube_id: Option<TubeId>) -> Self {
        Self {
            kind,
            tube_id,
            payload: None,
        }
    }

    /// Build the `data` event for a received CBOR payload.
    pub fn data(tube_id: TubeId, payload: Option<Value>) -> Self {
        Self {
            kind: EventKind::Data,
            tube_id: Some(tube_id),
            payload,
        }
    }
}

type Callback = Box<dyn FnMut(&Event) + Send>;

/// Registry of callbacks bound to each [`EventKind`].
#[derive(Default)]
pub struct Dispatcher {
    callbacks: HashMap<EventKind, Vec<Callback>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a callback to the named event. Returns an error if `name` isn't
    /// one of the six recognized event names.
    pub fn bind(&mut self, name: &str, callback: Callback) -> crate::error::Result<()> {
        let kind = EventKind::from_name(name)
            .ok_or_else(|| crate::error::Error::not_found(format!("unknown event '{name}'")))?;
        self.callbacks.entry(kind).or_default().push(callback);
        Ok(())
    }

    /// Run every callback bound to `event.kind`, in registration order.
    pub fn fire(&mut self, event: Event) {
        if let Some(callbacks) = self.callbacks.get_mut(&event.kind) {
            for callback in callbacks.iter_mut() {
                callback(&event);
            }
        }
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.callbacks
            .get(&kind)
            .map(|cbs| !cbs.is_empty())
            .unwrap_or(false)
    }
}
