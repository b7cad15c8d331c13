//! The expectations store (§4.8): process-wide state shared across
//! reconciles so a reconcile never acts twice on the same write before the
//! orchestrator's own cache has caught up (§3 "Expectations record", §5
//! "Shared resources and locking policy").

use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use stackable_operator::kube::{Resource, ResourceExt};

/// Per-cluster state. The generation map is guarded by its own mutex; the
/// counters are atomic, per §5's locking policy ("the expectations store
/// uses a single reader-writer mutex guarding the per-cluster map; counters
/// underneath are atomic").
#[derive(Default)]
struct ClusterExpectations {
    generations: Mutex<HashMap<String, i64>>,
    adds: AtomicI64,
    dels: AtomicI64,
    last_write: Mutex<Option<Instant>>,
}

const COUNTER_TTL: Duration = Duration::from_secs(5 * 60);

/// A minimal view of an orchestrator object's identity + generation, so
/// callers don't need to depend on a concrete `kube` resource type here.
pub struct ObjectMeta {
    pub uid: String,
    pub generation: i64,
}

impl ObjectMeta {
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Some(ObjectMeta {
            uid: resource.meta().uid.clone()?,
            generation: resource.meta().generation?,
        })
    }
}

/// Process-wide, safe for concurrent use from many cluster reconciles at
/// once (§5). Keep as an explicit collaborator passed into the
/// reconciliation driver, not a singleton (§9 "Global mutable state").
#[derive(Clone, Default)]
pub struct ExpectationsStore {
    clusters: std::sync::Arc<RwLock<HashMap<String, std::sync::Arc<ClusterExpectations>>>>,
}

impl ExpectationsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster_entry(&self, cluster_key: &str) -> std::sync::Arc<ClusterExpectations> {
        if let Some(existing) = self.clusters.read().unwrap().get(cluster_key) {
            return existing.clone();
        }
        self.clusters
            .write()
            .unwrap()
            .entry(cluster_key.to_string())
            .or_default()
            .clone()
    }

    /// Records that this operator just wrote `meta` for an object of
    /// `cluster_key`; call immediately after every mutating orchestrator
    /// write.
    pub fn expect_generation(&self, cluster_key: &str, meta: &ObjectMeta) {
        let entry = self.cluster_entry(cluster_key);
        entry
            .generations
            .lock()
            .unwrap()
            .insert(meta.uid.clone(), meta.generation);
    }

    /// Returns `false` iff any provided generation is strictly less than the
    /// last one this operator wrote — i.e. the cache is known-stale and this
    /// reconcile must not act on it (§4.1 step 2).
    pub fn generation_expected(&self, cluster_key: &str, metas: &[ObjectMeta]) -> bool {
        let clusters = self.clusters.read().unwrap();
        let Some(entry) = clusters.get(cluster_key) else {
            return true;
        };
        let generations = entry.generations.lock().unwrap();
        metas.iter().all(|meta| {
            generations
                .get(&meta.uid)
                .is_none_or(|&expected| meta.generation >= expected)
        })
    }

    /// Historical creation/deletion counters, retained for pod-level
    /// expectations outside the stateful-group core (§4.8). Counters cannot
    /// go below zero; attempts clamp back to zero.
    pub fn raise_add_expectation(&self, cluster_key: &str) {
        let entry = self.cluster_entry(cluster_key);
        entry.adds.fetch_add(1, Ordering::SeqCst);
        *entry.last_write.lock().unwrap() = Some(Instant::now());
    }

    pub fn raise_del_expectation(&self, cluster_key: &str) {
        let entry = self.cluster_entry(cluster_key);
        entry.dels.fetch_add(1, Ordering::SeqCst);
        *entry.last_write.lock().unwrap() = Some(Instant::now());
    }

    pub fn observed_add(&self, cluster_key: &str) {
        let entry = self.cluster_entry(cluster_key);
        let _ = entry
            .adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }

    pub fn observed_del(&self, cluster_key: &str) {
        let entry = self.cluster_entry(cluster_key);
        let _ = entry
            .dels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }

    /// `true` iff both counters are zero, or the 5-minute TTL since the last
    /// write has elapsed (in which case both are reset to zero and treated
    /// as fulfilled).
    pub fn fulfilled(&self, cluster_key: &str) -> bool {
        let entry = self.cluster_entry(cluster_key);
        let adds = entry.adds.load(Ordering::SeqCst);
        let dels = entry.dels.load(Ordering::SeqCst);
        if adds == 0 && dels == 0 {
            return true;
        }
        let mut last_write = entry.last_write.lock().unwrap();
        let expired = last_write
            .map(|at| at.elapsed() >= COUNTER_TTL)
            .unwrap_or(true);
        if expired {
            entry.adds.store(0, Ordering::SeqCst);
            entry.dels.store(0, Ordering::SeqCst);
            *last_write = None;
            true
        } else {
            false
        }
    }

    /// Removes every entry for `cluster_key`. Call when the cluster resource
    /// is deleted.
    pub fn forget(&self, cluster_key: &str) {
        self.clusters.write().unwrap().remove(cluster_key);
    }
}

pub fn cluster_key<K: Resource>(resource: &K) -> String {
    format!(
        "{ns}/{name}",
        ns = resource.namespace().unwrap_or_default(),
        name = resource.name_any()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_has_no_pending_expectations() {
        let store = ExpectationsStore::new();
        assert!(store.generation_expected("ns/a", &[]));
        assert!(store.fulfilled("ns/a"));
    }

    #[test]
    fn stale_cache_is_detected() {
        let store = ExpectationsStore::new();
        store.expect_generation(
            "ns/a",
            &ObjectMeta {
                uid: "group-a".to_string(),
                generation: 7,
            },
        );
        assert!(!store.generation_expected(
            "ns/a",
            &[ObjectMeta {
                uid: "group-a".to_string(),
                generation: 6,
            }]
        ));
        assert!(store.generation_expected(
            "ns/a",
            &[ObjectMeta {
                uid: "group-a".to_string(),
                generation: 7,
            }]
        ));
    }

    #[test]
    fn counters_clamp_at_zero() {
        let store = ExpectationsStore::new();
        store.observed_add("ns/a");
        store.observed_add("ns/a");
        assert!(store.fulfilled("ns/a"));
    }

    #[test]
    fn forget_removes_all_state() {
        let store = ExpectationsStore::new();
        store.raise_add_expectation("ns/a");
        store.forget("ns/a");
        assert!(store.fulfilled("ns/a"));
    }
}
