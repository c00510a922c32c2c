//! Ordered listener lists keyed by event name
//!
//! Listeners are called synchronously, in registration order, outside the
//! internal lock, so a listener may register or remove listeners itself.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`EventEmitter::on`], used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

pub struct EventEmitter<K, A> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<K, Vec<(ListenerId, Listener<A>)>>>,
}

impl<K, A> EventEmitter<K, A>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn on<F>(&self, key: K, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.lock();
        listeners
            .entry(key)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener. Returns false if it was not registered under `key`.
    pub fn off(&self, key: &K, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(key);
        }
        removed
    }

    /// Call every listener registered for `key`. Returns the number called.
    pub fn emit(&self, key: &K, arg: &A) -> usize {
        let snapshot: Vec<Listener<A>> = {
            let listeners = self.lock();
            match listeners.get(key) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return 0,
            }
        };

        for listener in &snapshot {
            listener(arg);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    pub fn remove_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Vec<(ListenerId, Listener<A>)>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, A> Default for EventEmitter<K, A>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
