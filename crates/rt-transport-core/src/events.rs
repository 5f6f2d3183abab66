//! Type-indexed multi-listener event dispatcher (spec.md §2 component 8,
//! §9 design note). Listener add/remove during dispatch is safe because
//! `dispatch` snapshots each kind's listener list before iterating.

use rt_wire::TransportMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ProtocolErrorKind;
use crate::state_machine::SessionConnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Closed,
}

/// Everything a listener can be notified of. One variant per event kind in
/// spec.md §6's consumer API table.
#[derive(Debug, Clone)]
pub enum Event {
    Message(TransportMessage),
    ConnectionStatus { peer: String, status: ConnStatus },
    SessionStatus {
        peer: String,
        session_id: String,
        status: ConnStatus,
    },
    SessionTransition { peer: String, state: SessionConnState },
    ProtocolError {
        peer: Option<String>,
        kind: ProtocolErrorKind,
    },
    TransportStatus(TransportStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    ConnectionStatus,
    SessionStatus,
    SessionTransition,
    ProtocolError,
    TransportStatus,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Message(_) => EventKind::Message,
            Event::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            Event::SessionStatus { .. } => EventKind::SessionStatus,
            Event::SessionTransition { .. } => EventKind::SessionTransition,
            Event::ProtocolError { .. } => EventKind::ProtocolError,
            Event::TransportStatus(_) => EventKind::TransportStatus,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle returned by `add_event_listener`, usable to remove it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    handler: Handler,
}

#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            handler: Arc::new(handler),
        };
        self.listeners
            .lock()
            .expect("event dispatcher mutex poisoned")
            .entry(kind)
            .or_default()
            .push(entry);
        id
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        if let Some(list) = self
            .listeners
            .lock()
            .expect("event dispatcher mutex poisoned")
            .get_mut(&kind)
        {
            list.retain(|e| e.id != id);
        }
    }

    pub fn remove_all(&self) {
        self.listeners
            .lock()
            .expect("event dispatcher mutex poisoned")
            .clear();
    }

    /// Dispatch one event. Snapshots the listener list for `event.kind()`
    /// before iterating so a handler adding/removing listeners doesn't
    /// perturb the dispatch in progress.
    pub fn dispatch(&self, event: Event) {
        let snapshot: Vec<Handler> = {
            let guard = self.listeners.lock().expect("event dispatcher mutex poisoned");
            guard
                .get(&event.kind())
                .map(|list| list.iter().map(|e| e.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};

    #[test]
    fn dispatch_calls_only_listeners_for_matching_kind() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.add_listener(EventKind::TransportStatus, move |_| {
            hits2.fetch_add(1, O::SeqCst);
        });
        dispatcher.add_listener(EventKind::Message, |_| panic!("should not fire"));

        dispatcher.dispatch(Event::TransportStatus(TransportStatus::Closed));
        assert_eq!(hits.load(O::SeqCst), 1);
    }

    #[test]
    fn removed_listener_does_not_fire() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = dispatcher.add_listener(EventKind::TransportStatus, move |_| {
            hits2.fetch_add(1, O::SeqCst);
        });
        dispatcher.remove_listener(EventKind::TransportStatus, id);
        dispatcher.dispatch(Event::TransportStatus(TransportStatus::Closed));
        assert_eq!(hits.load(O::SeqCst), 0);
    }

    #[test]
    fn handler_adding_a_listener_mid_dispatch_does_not_affect_current_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let added = Arc::new(AtomicUsize::new(0));
        let d2 = dispatcher.clone();
        let added2 = added.clone();
        dispatcher.add_listener(EventKind::TransportStatus, move |_| {
            d2.add_listener(EventKind::TransportStatus, {
                let added3 = added2.clone();
                move |_| {
                    added3.fetch_add(1, O::SeqCst);
                }
            });
        });
        dispatcher.dispatch(Event::TransportStatus(TransportStatus::Closed));
        assert_eq!(added.load(O::SeqCst), 0, "newly added listener must not see this dispatch");
        dispatcher.dispatch(Event::TransportStatus(TransportStatus::Closed));
        assert_eq!(added.load(O::SeqCst), 1, "but should see the next one");
    }
}
