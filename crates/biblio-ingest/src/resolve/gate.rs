//! Keyed mutual exclusion: at most one holder per natural key.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of async mutexes keyed by string. Slots are created on demand and
/// removed when the last holder or waiter releases them.
#[derive(Debug, Default)]
pub struct KeyedGate {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one lookup-or-create.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a KeyedGate,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: impl Into<String>) -> GateGuard<'_> {
        let key = key.into();
        // The shard lock must be released before awaiting the slot.
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let guard = slot.lock_owned().await;
        GateGuard {
            gate: self,
            key,
            guard: Some(guard),
        }
    }

    /// Lock several keys in sorted order; duplicates are locked once.
    pub async fn lock_many<I, K>(&self, keys: I) -> Vec<GateGuard<'_>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of live slots (held or awaited).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl GateGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.gate
            .slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_reclaimed() {
        let gate = KeyedGate::new();
        {
            let guard = gate.lock("author:orcid:0000-0001").await;
            assert_eq!(guard.key(), "author:orcid:0000-0001");
            assert_eq!(gate.len(), 1);
        }
        assert!(gate.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let gate = Arc::new(KeyedGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = gate.lock("journal:issn:1234-5678").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(gate.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let gate = KeyedGate::new();
        let _a = gate.lock("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), gate.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_dedups_and_sorts() {
        let gate = KeyedGate::new();
        let guards = gate.lock_many(["doc:sec:PMID:1", "doc:ext:10.1/x", "doc:sec:PMID:1"]).await;
        let keys: Vec<&str> = guards.iter().map(GateGuard::key).collect();
        assert_eq!(keys, vec!["doc:ext:10.1/x", "doc:sec:PMID:1"]);
        drop(guards);
        assert!(gate.is_empty());
    }
}
