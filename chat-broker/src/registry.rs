//! Subscriber registry: identity → outbound delivery channel.
//!
//! Mutations take the write lock; dispatch lookups and broadcast snapshots
//! share the read lock. No lock is ever held across an `.await` or a
//! delivery attempt: lookups hand back cloned senders.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio::sync::mpsc;

use crate::message::Message;

/// Outbound channel a subscriber registers. The broker only ever calls
/// `try_send` on it; the receiving half stays with whoever registered it.
pub type Outbox = mpsc::Sender<Message>;

#[derive(Default)]
pub struct Registry {
    subscribers: RwLock<HashMap<String, Outbox>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `id` with `outbox`, returning the channel it replaced.
    pub fn register(&self, id: impl Into<String>, outbox: Outbox) -> Option<Outbox> {
        self.write().insert(id.into(), outbox)
    }

    /// Registers `outbox` only if `id` is free. Returns whether it was inserted.
    pub fn claim(&self, id: impl Into<String>, outbox: Outbox) -> bool {
        let mut subscribers = self.write();
        let id = id.into();
        if subscribers.contains_key(&id) {
            return false;
        }
        subscribers.insert(id, outbox);
        true
    }

    /// Removes `id`. Absent identities are ignored.
    pub fn unregister(&self, id: &str) -> Option<Outbox> {
        self.write().remove(id)
    }

    /// Removes `id` only while it still maps to the same channel as `outbox`.
    pub fn unregister_if_current(&self, id: &str, outbox: &Outbox) -> bool {
        let mut subscribers = self.write();
        match subscribers.get(id) {
            Some(current) if current.same_channel(outbox) => {
                subscribers.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Outbox> {
        self.read().get(id).cloned()
    }

    /// Channels registered at the moment of the call.
    pub fn snapshot(&self) -> Vec<(String, Outbox)> {
        self.read()
            .iter()
            .map(|(id, outbox)| (id.clone(), outbox.clone()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sorted list of registered identities.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // A panic while holding the lock cannot leave the map half-updated
    // (every mutation is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Outbox>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Outbox>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<Message>) {
        mpsc::channel(4)
    }

    #[test]
    fn register_overwrites_previous_channel() {
        let registry = Registry::new();
        let (first, _rx1) = outbox();
        let (second, _rx2) = outbox();

        assert!(registry.register("alice", first.clone()).is_none());
        let replaced = registry
            .register("alice", second.clone())
            .expect("first channel should be replaced");

        assert!(replaced.same_channel(&first));
        let current = registry.lookup("alice").expect("alice registered");
        assert!(current.same_channel(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_absent_identity_is_a_no_op() {
        let registry = Registry::new();
        assert!(registry.unregister("nobody").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn claim_refuses_occupied_identity() {
        let registry = Registry::new();
        let (first, _rx1) = outbox();
        let (second, _rx2) = outbox();

        assert!(registry.claim("alice", first.clone()));
        assert!(!registry.claim("alice", second));

        let current = registry.lookup("alice").expect("alice registered");
        assert!(current.same_channel(&first));
    }

    #[test]
    fn unregister_if_current_keeps_successor() {
        let registry = Registry::new();
        let (stale, _rx1) = outbox();
        let (fresh, _rx2) = outbox();

        registry.register("alice", stale.clone());
        registry.register("alice", fresh.clone());

        assert!(!registry.unregister_if_current("alice", &stale));
        assert!(registry.contains("alice"));

        assert!(registry.unregister_if_current("alice", &fresh));
        assert!(!registry.contains("alice"));
    }

    #[test]
    fn snapshot_and_ids_reflect_membership() {
        let registry = Registry::new();
        let (a, _rx_a) = outbox();
        let (b, _rx_b) = outbox();
        registry.register("bob", b);
        registry.register("alice", a);

        assert_eq!(registry.ids(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.snapshot().len(), 2);

        registry.unregister("bob");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "alice");
    }

    #[test]
    fn concurrent_mutation_and_reads_stay_consistent() {
        let registry = Arc::new(Registry::new());
        let (tx, _rx) = outbox();

        let writers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                let tx = tx.clone();
                thread::spawn(move || {
                    for round in 0..500 {
                        let id = format!("user-{worker}-{}", round % 10);
                        registry.register(id.clone(), tx.clone());
                        let _ = registry.snapshot();
                        registry.unregister(&id);
                    }
                })
            })
            .collect();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    for (id, _) in registry.snapshot() {
                        assert!(id.starts_with("user-"));
                    }
                }
            })
        };

        for writer in writers {
            writer.join().expect("writer thread");
        }
        reader.join().expect("reader thread");

        assert!(registry.is_empty());
    }
}
