//! Typed observer lists.

use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{CommoError, Result};

/// A set of registered listeners of one kind.
///
/// Listeners are compared by pointer identity. Fan-out iterates over a
/// snapshot, so callbacks may register or remove listeners without
/// deadlocking.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Fails if it is already present.
    pub fn add(&self, listener: Arc<L>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| same(l, &listener)) {
            return Err(CommoError::invalid("listener already registered"));
        }
        listeners.push(listener);
        Ok(())
    }

    /// Remove a listener. Fails if it was never registered.
    pub fn remove(&self, listener: &Arc<L>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        if listeners.len() == before {
            return Err(CommoError::invalid("listener not registered"));
        }
        Ok(())
    }

    /// Copy of the current listeners.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().clone()
    }

    /// Call `f` for every registered listener.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
