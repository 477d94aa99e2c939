//! Ordered registry of state-change listeners.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::state::StateChange;

/// Callback invoked after every committed state transition.
pub type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Handle returned by [`SessionMachine::subscribe`](crate::SessionMachine::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
}

/// Listeners in registration order.
#[derive(Default)]
pub(crate) struct Subscribers {
    registry: Mutex<Registry>,
}

impl Subscribers {
    pub(crate) fn add(&self, listener: Listener) -> SubscriptionId {
        let mut registry = self.registry.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    /// Deliver `change` to every listener.
    ///
    /// The list is cloned first so listeners may subscribe or unsubscribe
    /// from inside a callback.
    pub(crate) fn notify(&self, change: &StateChange) {
        let listeners: Vec<Listener> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}
