//! One-shot aggregation of per-key results
//!
//! Fans a multi-peer operation out as independent sends and completes a
//! single receiver with the full result map once every key has reported.
//! Each key must report exactly once; a duplicate arrival is a programming
//! error.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Gathers one result per key, completing when the key set is empty
pub struct ResultsGatherer<K, V> {
    inner: Mutex<GatherInner<K, V>>,
}

struct GatherInner<K, V> {
    pending: HashSet<K>,
    results: HashMap<K, V>,
    done: Option<oneshot::Sender<HashMap<K, V>>>,
}

impl<K, V> ResultsGatherer<K, V>
where
    K: Eq + Hash,
{
    /// Create a gatherer for the given keys and the completion receiver
    ///
    /// An empty key set completes immediately with an empty map.
    pub fn new(keys: impl IntoIterator<Item = K>) -> (Arc<Self>, oneshot::Receiver<HashMap<K, V>>) {
        let pending: HashSet<K> = keys.into_iter().collect();
        let (tx, rx) = oneshot::channel();

        if pending.is_empty() {
            let _ = tx.send(HashMap::new());
            return (
                Arc::new(Self {
                    inner: Mutex::new(GatherInner {
                        pending,
                        results: HashMap::new(),
                        done: None,
                    }),
                }),
                rx,
            );
        }

        (
            Arc::new(Self {
                inner: Mutex::new(GatherInner {
                    pending,
                    results: HashMap::new(),
                    done: Some(tx),
                }),
            }),
            rx,
        )
    }

    /// Record the result for `key`
    ///
    /// Panics if `key` was not part of the pending set or already reported.
    pub fn gather(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        let was_pending = inner.pending.remove(&key);
        assert!(was_pending, "result gathered twice for the same key");

        inner.results.insert(key, value);

        if inner.pending.is_empty() {
            if let Some(done) = inner.done.take() {
                let results = std::mem::take(&mut inner.results);
                let _ = done.send(results);
            }
        }
    }

    /// Number of keys still outstanding
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
