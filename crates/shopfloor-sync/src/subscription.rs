//! # Subscription Registry
//!
//! Fan-out of inbound and local events to in-process consumers.
//!
//! ## Fan-out
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Subscription Registry                               │
//! │                                                                         │
//! │  connection actor ──dispatch(event)──┐                                 │
//! │  reconciler ───────publish_local()───┤                                 │
//! │                                      ▼                                  │
//! │            ┌─────────────────────────────────────────────┐             │
//! │            │ by_type: "oee_update" → [sub 1, sub 4]      │             │
//! │            │          "andon_call" → [sub 2]             │             │
//! │            │ refcount: oee_update=2, andon_call=1        │             │
//! │            └──────────────────┬──────────────────────────┘             │
//! │                               │ lock released, then for each match:    │
//! │                               ▼                                         │
//! │          filter {lineId: "L1"} ─► callback (panics caught)             │
//! │                                                                         │
//! │  first subscriber of a type ──► SubscriptionChange::Added   ─┐         │
//! │  last one gone              ──► SubscriptionChange::Removed ─┴► actor  │
//! │                                 (sends subscribe/unsubscribe frames)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use shopfloor_core::validation::validate_event_type;

use crate::error::SyncResult;
use crate::protocol::{self, EventMessage};

pub type SubscriptionId = u64;

/// Consumer callback. Runs on the dispatching task, so keep it short.
pub type EventCallback = Arc<dyn Fn(&EventMessage) + Send + Sync>;

// =============================================================================
// Filters
// =============================================================================

/// Field-equality predicate over the event payload.
///
/// Every key must be present in the payload object with an equal value.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    fields: BTreeMap<String, Value>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, data: &Value) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let Some(obj) = data.as_object() else {
            return false;
        };
        self.fields.iter().all(|(k, v)| obj.get(k) == Some(v))
    }
}

impl From<Map<String, Value>> for EventFilter {
    fn from(map: Map<String, Value>) -> Self {
        EventFilter {
            fields: map.into_iter().collect(),
        }
    }
}

// =============================================================================
// Registry State
// =============================================================================

/// Tells the connection actor which server-side subscriptions to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Added(String),
    Removed(String),
}

struct Subscription {
    id: SubscriptionId,
    event_type: String,
    filter: Option<EventFilter>,
    callback: EventCallback,
}

#[derive(Default)]
struct RegistryState {
    by_type: HashMap<String, Vec<Subscription>>,
    changes: Option<mpsc::UnboundedSender<SubscriptionChange>>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl RegistryInner {
    // a panicking callback never runs under the lock, but stay usable anyway
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, event_type: &str, id: SubscriptionId) -> bool {
        self.read()
            .by_type
            .get(event_type)
            .is_some_and(|subs| subs.iter().any(|s| s.id == id))
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut state = self.write();
        let Some(event_type) = state
            .by_type
            .iter()
            .find(|(_, subs)| subs.iter().any(|s| s.id == id))
            .map(|(t, _)| t.clone())
        else {
            return false;
        };

        let now_empty = match state.by_type.get_mut(&event_type) {
            Some(subs) => {
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => false,
        };

        if now_empty {
            state.by_type.remove(&event_type);
            if !protocol::is_local_event(&event_type) {
                if let Some(tx) = &state.changes {
                    let _ = tx.send(SubscriptionChange::Removed(event_type.clone()));
                }
            }
        }

        debug!(subscription_id = id, event_type = %event_type, "Unsubscribed");
        true
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Shared registry handle. Clones see the same subscriptions.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Routes server-subscription changes to the returned receiver.
    /// Replaces any earlier receiver.
    pub(crate) fn attach(&self) -> mpsc::UnboundedReceiver<SubscriptionChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().changes = Some(tx);
        rx
    }

    /// Registers a callback for `event_type`.
    ///
    /// Dropping the returned handle unsubscribes.
    pub fn subscribe(
        &self,
        event_type: &str,
        filter: Option<EventFilter>,
        callback: EventCallback,
    ) -> SyncResult<SubscriptionHandle> {
        validate_event_type(event_type)?;
        let event_type = event_type.trim().to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.inner.write();
        let subs = state.by_type.entry(event_type.clone()).or_default();
        let first = subs.is_empty();
        subs.push(Subscription {
            id,
            event_type: event_type.clone(),
            filter: filter.filter(|f| !f.is_empty()),
            callback,
        });

        if first && !protocol::is_local_event(&event_type) {
            if let Some(tx) = &state.changes {
                let _ = tx.send(SubscriptionChange::Added(event_type.clone()));
            }
        }
        drop(state);

        debug!(subscription_id = id, event_type = %event_type, "Subscribed");
        Ok(SubscriptionHandle {
            id,
            event_type,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Convenience wrapper taking a closure.
    pub fn on<F>(&self, event_type: &str, callback: F) -> SyncResult<SubscriptionHandle>
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.subscribe(event_type, None, Arc::new(callback))
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Delivers an event to every matching subscriber. Returns how many
    /// callbacks ran without panicking.
    pub fn dispatch(&self, event: &EventMessage) -> usize {
        let targets: Vec<(SubscriptionId, EventCallback)> = {
            let state = self.inner.read();
            match state.by_type.get(&event.event_type) {
                Some(subs) => subs
                    .iter()
                    .filter(|s| s.filter.as_ref().map_or(true, |f| f.matches(&event.data)))
                    .map(|s| (s.id, Arc::clone(&s.callback)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for (id, callback) in targets {
            // an earlier callback may have unsubscribed this one
            if !self.inner.is_live(&event.event_type, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    subscription_id = id,
                    event_type = %event.event_type,
                    "Subscriber callback panicked"
                ),
            }
        }
        delivered
    }

    /// Publishes an in-process event (`connection:*`, `sync:*`, `server:*`).
    pub fn publish_local(&self, event_type: &str, data: Value) -> usize {
        if !protocol::is_local_event(event_type) {
            warn!(event_type, "Publishing non-local event type locally");
        }
        self.dispatch(&EventMessage::new(event_type, data))
    }

    /// Event types that need a server-side subscription.
    pub fn active_event_types(&self) -> Vec<String> {
        let state = self.inner.read();
        let mut types: Vec<String> = state
            .by_type
            .keys()
            .filter(|t| !protocol::is_local_event(t))
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .read()
            .by_type
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.inner
            .read()
            .by_type
            .values()
            .any(|subs| subs.iter().any(|s| s.id == id))
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        let subs: Vec<(&str, SubscriptionId)> = state
            .by_type
            .values()
            .flatten()
            .map(|s| (s.event_type.as_str(), s.id))
            .collect();
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &subs)
            .finish()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    event_type: String,
    registry: Weak<RegistryInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Unsubscribes now. Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(self.id);
        }
    }
}
