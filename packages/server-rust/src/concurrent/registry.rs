//! Sharded concurrent registry of live sessions.
//!
//! Entries are spread over [`SHARD_COUNT`] independently locked maps keyed by
//! `id % SHARD_COUNT`, so registration, lookup and removal on different
//! shards never contend. Admission is controlled by an `accepting` gate that
//! is checked under the shard lock, which makes `set` and `dispose` race-free:
//! an entry is either inserted before its shard is drained (and then drained
//! with it) or rejected.
//!
//! A `pending` counter tracks entries that are registered or still being
//! drained. Each entry is settled exactly once, by whichever of
//! [`ShardedRegistry::remove`] or the drain reaches it first.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use framewire_core::{AtomicBoolean, AtomicInt64};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use super::ids::SessionId;

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 32;

/// A value the registry can tear down when it is disposed.
#[async_trait]
pub trait Disposable: Send + Sync {
    /// Releases the value and resolves once it is fully shut down.
    async fn dispose(&self);
}

/// Errors returned by registry mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry has been disposed")]
    Disposed,

    #[error("session {0} is already registered")]
    Duplicate(SessionId),
}

/// Session registry split over [`SHARD_COUNT`] `RwLock`-guarded maps.
pub struct ShardedRegistry<V> {
    shards: Vec<RwLock<HashMap<SessionId, V>>>,
    accepting: AtomicBoolean,
    pending: AtomicInt64,
    draining: Mutex<HashSet<SessionId>>,
    drained: Notify,
}

impl<V> ShardedRegistry<V>
where
    V: Disposable + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            accepting: AtomicBoolean::new(true),
            pending: AtomicInt64::new(0),
            draining: Mutex::new(HashSet::new()),
            drained: Notify::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, id: SessionId) -> &RwLock<HashMap<SessionId, V>> {
        &self.shards[(id.0 % SHARD_COUNT as u64) as usize]
    }

    /// Registers `value` under `id`.
    ///
    /// # Errors
    ///
    /// `Disposed` once [`ShardedRegistry::dispose`] has started, `Duplicate`
    /// if `id` is already present.
    pub fn set(&self, id: SessionId, value: V) -> Result<(), RegistryError> {
        let mut shard = self.shard(id).write();
        if !self.accepting.get() {
            return Err(RegistryError::Disposed);
        }
        if shard.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        shard.insert(id, value);
        self.pending.increment_and_get();
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<V> {
        self.shard(id).read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.shard(id).read().contains_key(&id)
    }

    /// Removes `id`, returning the entry if it was still registered.
    ///
    /// During disposal the entry may already have been moved out by the drain;
    /// the call then only settles it.
    pub fn remove(&self, id: SessionId) -> Option<V> {
        let removed = self.shard(id).write().remove(&id);
        if removed.is_some() {
            self.release_one();
        } else {
            self.settle(id);
        }
        removed
    }

    /// Number of registered entries (plus entries still being drained).
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.pending.get()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        !self.accepting.get()
    }

    /// Snapshot of every registered entry.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Stops admission, disposes every entry and waits until all of them
    /// have settled.
    ///
    /// Safe to call more than once; later callers wait for the same drain.
    pub async fn dispose(&self) {
        if self.accepting.compare_and_set(true, false) {
            let mut drained = Vec::new();
            for shard in &self.shards {
                let mut map = shard.write();
                let mut draining = self.draining.lock();
                for (id, value) in map.drain() {
                    draining.insert(id);
                    drained.push((id, value));
                }
            }
            debug!(entries = drained.len(), "draining registry");

            join_all(drained.iter().map(|(id, value)| async move {
                value.dispose().await;
                self.settle(*id);
            }))
            .await;
        }

        self.wait_drained().await;
    }

    fn settle(&self, id: SessionId) {
        if self.draining.lock().remove(&id) {
            self.release_one();
        }
    }

    fn release_one(&self) {
        if self.pending.decrement_and_get() <= 0 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.get() <= 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<V> Default for ShardedRegistry<V>
where
    V: Disposable + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use framewire_core::AtomicInt32;

    use super::*;

    #[derive(Clone)]
    struct Probe {
        id: SessionId,
        disposed: Arc<AtomicInt32>,
        registry: Option<Weak<ShardedRegistry<Probe>>>,
        delay: Option<Duration>,
    }

    impl Probe {
        fn new(id: u64) -> Self {
            Self {
                id: SessionId(id),
                disposed: Arc::new(AtomicInt32::new(0)),
                registry: None,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Disposable for Probe {
        async fn dispose(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.disposed.increment_and_get();
            // Mirrors a session close callback deregistering itself.
            if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
                registry.remove(self.id);
            }
        }
    }

    #[test]
    fn set_get_remove() {
        let registry = ShardedRegistry::new();
        registry.set(SessionId(1), Probe::new(1)).unwrap();
        registry.set(SessionId(33), Probe::new(33)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(SessionId(33)));
        assert_eq!(registry.get(SessionId(1)).unwrap().id, SessionId(1));

        assert!(registry.remove(SessionId(1)).is_some());
        assert!(registry.get(SessionId(1)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let registry: ShardedRegistry<Probe> = ShardedRegistry::new();
        assert!(registry.remove(SessionId(7)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn duplicate_id_rejected_without_counting() {
        let registry = ShardedRegistry::new();
        registry.set(SessionId(5), Probe::new(5)).unwrap();
        let err = registry.set(SessionId(5), Probe::new(5)).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(SessionId(5)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn values_spans_every_shard() {
        let registry = ShardedRegistry::new();
        for id in 0..(SHARD_COUNT as u64 * 2) {
            registry.set(SessionId(id), Probe::new(id)).unwrap();
        }
        assert_eq!(registry.values().len(), SHARD_COUNT * 2);
    }

    #[tokio::test]
    async fn dispose_releases_every_entry() {
        let registry = ShardedRegistry::new();
        let probes: Vec<_> = (0..100).map(Probe::new).collect();
        for p in &probes {
            registry.set(p.id, p.clone()).unwrap();
        }

        registry.dispose().await;

        assert!(registry.is_empty());
        assert!(registry.is_disposed());
        for p in &probes {
            assert_eq!(p.disposed.get(), 1);
            assert!(registry.get(p.id).is_none());
        }
    }

    #[tokio::test]
    async fn set_after_dispose_is_rejected() {
        let registry: ShardedRegistry<Probe> = ShardedRegistry::new();
        registry.dispose().await;
        let err = registry.set(SessionId(1), Probe::new(1)).unwrap_err();
        assert_eq!(err, RegistryError::Disposed);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn self_removal_during_dispose_settles_once() {
        let registry = Arc::new(ShardedRegistry::new());
        let probes: Vec<_> = (0..64)
            .map(|id| {
                let mut p = Probe::new(id);
                p.registry = Some(Arc::downgrade(&registry));
                p
            })
            .collect();
        for p in &probes {
            registry.set(p.id, p.clone()).unwrap();
        }

        registry.dispose().await;

        // Both the close callback and the drain settle each entry; the
        // counter must still land exactly on zero.
        assert_eq!(registry.pending.get(), 0);
        assert!(probes.iter().all(|p| p.disposed.get() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_waits_for_slow_entries() {
        let registry = ShardedRegistry::new();
        let mut slow = Probe::new(1);
        slow.delay = Some(Duration::from_secs(5));
        registry.set(slow.id, slow.clone()).unwrap();

        registry.dispose().await;
        assert_eq!(slow.disposed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dispose_callers_both_wait() {
        let registry = Arc::new(ShardedRegistry::new());
        let mut slow = Probe::new(1);
        slow.delay = Some(Duration::from_secs(1));
        registry.set(slow.id, slow.clone()).unwrap();

        let first = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.dispose().await }
        });
        tokio::task::yield_now().await;
        registry.dispose().await;
        assert_eq!(slow.disposed.get(), 1);
        first.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn registration_racing_dispose_never_leaks() {
        let registry = Arc::new(ShardedRegistry::new());
        let mut writers = Vec::new();
        for worker in 0..8u64 {
            let registry = Arc::clone(&registry);
            writers.push(tokio::spawn(async move {
                let mut accepted = Vec::new();
                for n in 0..200u64 {
                    let probe = Probe::new(worker * 1_000 + n);
                    if registry.set(probe.id, probe.clone()).is_ok() {
                        accepted.push(probe);
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            }));
        }

        tokio::task::yield_now().await;
        registry.dispose().await;

        let mut accepted = Vec::new();
        for w in writers {
            accepted.extend(w.await.unwrap());
        }
        for probe in &accepted {
            assert_eq!(probe.disposed.get(), 1, "entry {} not drained", probe.id);
        }
        assert!(registry.is_empty());
    }
}
