use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

pub(crate) type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

type Key = (String, String);

/// Listeners keyed by `(target, event)`.
#[derive(Default)]
pub(crate) struct ListenerTable {
    next_id: u64,
    entries: HashMap<Key, Vec<(u64, Listener)>>,
}

impl ListenerTable {
    fn insert(&mut self, key: Key, listener: Listener) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(key).or_default().push((id, listener));
        id
    }

    fn remove(&mut self, key: &Key, id: u64) {
        if let Some(listeners) = self.entries.get_mut(key) {
            listeners.retain(|(existing, _)| *existing != id);
            if listeners.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    pub(crate) fn remove_target(&mut self, target: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(t, _), _| t != target);
        before - self.entries.len()
    }

    /// Snapshot of the listeners for one pair, so they run without the lock held.
    pub(crate) fn listeners(&self, target: &str, event: &str) -> Vec<Listener> {
        self.entries
            .get(&(target.to_string(), event.to_string()))
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn register(
    table: &Arc<Mutex<ListenerTable>>,
    target: &str,
    event: &str,
    listener: Listener,
) -> Subscription {
    let key = (target.to_string(), event.to_string());
    let id = lock(table).insert(key.clone(), listener);
    Subscription {
        table: Arc::downgrade(table),
        key,
        id,
    }
}

/// Registration of one notification listener.
///
/// The listener stays installed while this value is alive; dropping it (or
/// calling [`unsubscribe`](Self::unsubscribe)) removes the listener.
#[must_use = "dropping a Subscription removes its listener"]
pub struct Subscription {
    table: Weak<Mutex<ListenerTable>>,
    key: Key,
    id: u64,
}

impl Subscription {
    pub fn target(&self) -> &str {
        &self.key.0
    }

    pub fn event(&self) -> &str {
        &self.key.1
    }

    /// Remove the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).remove(&self.key, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.key.0)
            .field("event", &self.key.1)
            .finish()
    }
}
