//! Bounded, newest-first store of canonical briefings.
//!
//! The store is an explicitly constructed handle: the application builds one and
//! hands clones to the session client (the only writer) and to every UI consumer
//! (readers). Mutations are synchronous and never await. Each one is followed by a
//! [`StoreChange`] on a broadcast channel, sent while the write lock is still held
//! so subscribers observe changes in mutation order.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cinder_protocol::{AgentRole, CanonicalBriefingEvent, EventType, UiTarget};
use log::{debug, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Size of the change notification channel.
const CHANGE_BUFFER_SIZE: usize = 256;

/// Notification sent to subscribers after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Appended {
        event: Arc<CanonicalBriefingEvent>,
        /// Events pushed out by capacity, oldest first.
        evicted: Vec<Uuid>,
    },
    Dismissed {
        event_id: Uuid,
    },
    Cleared,
}

#[derive(Debug)]
struct StoreState {
    /// Front is newest.
    events: VecDeque<Arc<CanonicalBriefingEvent>>,
    active_modal: Option<Uuid>,
    max_events: usize,
}

impl StoreState {
    fn position(&self, event_id: Uuid) -> Option<usize> {
        self.events.iter().position(|e| e.event_id == event_id)
    }
}

#[derive(Debug, Clone)]
pub struct EventStore {
    inner: Arc<RwLock<StoreState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl EventStore {
    /// Create a store holding at most `max_events` events (at least one).
    pub fn new(max_events: usize) -> Self {
        if max_events == 0 {
            warn!("Event store capacity 0 is not usable; holding 1 event");
        }
        let max_events = max_events.max(1);
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                events: VecDeque::with_capacity(max_events),
                active_modal: None,
                max_events,
            })),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive a [`StoreChange`] for every later mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert `event` as the newest entry, evicting the oldest beyond capacity.
    ///
    /// Returns `false`, changing nothing, when an event with the same id is
    /// already stored. A modal-targeted event becomes the active modal.
    pub fn append(&self, event: CanonicalBriefingEvent) -> bool {
        let mut state = self.write();
        if state.position(event.event_id).is_some() {
            debug!("Ignoring duplicate event {}", event.event_id);
            return false;
        }

        let event = Arc::new(event);
        if event.is_modal() {
            if let Some(previous) = state.active_modal.replace(event.event_id) {
                debug!("Modal {} replaced by {}", previous, event.event_id);
            }
        }
        state.events.push_front(Arc::clone(&event));

        let mut evicted = Vec::new();
        while state.events.len() > state.max_events {
            let Some(oldest) = state.events.pop_back() else {
                break;
            };
            if state.active_modal == Some(oldest.event_id) {
                state.active_modal = None;
            }
            evicted.push(oldest.event_id);
        }
        if !evicted.is_empty() {
            debug!("Evicted {} event(s) at capacity {}", evicted.len(), state.max_events);
        }

        // no subscribers is fine
        let _ = self.changes.send(StoreChange::Appended { event, evicted });
        true
    }

    /// Remove one event. Dismissing the active modal clears the modal slot.
    pub fn dismiss(&self, event_id: Uuid) -> bool {
        let mut state = self.write();
        let Some(index) = state.position(event_id) else {
            return false;
        };
        state.events.remove(index);
        if state.active_modal == Some(event_id) {
            state.active_modal = None;
        }
        let _ = self.changes.send(StoreChange::Dismissed { event_id });
        true
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.events.clear();
        state.active_modal = None;
        let _ = self.changes.send(StoreChange::Cleared);
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.read().max_events
    }

    /// Every event, newest first.
    pub fn snapshot(&self) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.read().events.iter().cloned().collect()
    }

    pub fn get(&self, event_id: Uuid) -> Option<Arc<CanonicalBriefingEvent>> {
        self.read()
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned()
    }

    fn filtered<F>(&self, predicate: F) -> Vec<Arc<CanonicalBriefingEvent>>
    where
        F: Fn(&CanonicalBriefingEvent) -> bool,
    {
        self.read()
            .events
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn by_agent(&self, agent: AgentRole) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.filtered(|e| e.source_agent == agent)
    }

    pub fn by_target(&self, target: UiTarget) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.filtered(|e| e.ui_binding.target == target)
    }

    pub fn by_type(&self, event_type: EventType) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.filtered(|e| e.event_type == event_type)
    }

    pub fn by_correlation(&self, correlation_id: Uuid) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.filtered(|e| e.correlation_id == correlation_id)
    }

    /// Direct children of `parent` in the cascade tree.
    pub fn children_of(&self, parent: Uuid) -> Vec<Arc<CanonicalBriefingEvent>> {
        self.filtered(|e| e.parent_event_id == Some(parent))
    }

    pub fn latest_by_agent(&self, agent: AgentRole) -> Option<Arc<CanonicalBriefingEvent>> {
        self.read()
            .events
            .iter()
            .find(|e| e.source_agent == agent)
            .cloned()
    }

    pub fn active_modal(&self) -> Option<Arc<CanonicalBriefingEvent>> {
        let state = self.read();
        let id = state.active_modal?;
        state.events.iter().find(|e| e.event_id == id).cloned()
    }

    pub fn is_active_modal(&self, event_id: Uuid) -> bool {
        self.read().active_modal == Some(event_id)
    }
}
