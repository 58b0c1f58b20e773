//! Convergence watcher: waits for replicas to become active
//!
//! A registration moves `registered → satisfied | timed-out` and always ends
//! `unregistered`: the [`WatchGuard`] removes itself from the registry when
//! dropped, whatever path the caller takes out of the wait.

use crate::common::{Error, Result};
use crate::coordinator::cluster_state::ClusterState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

struct ActiveReplicaWatch {
    collection: String,
    cores: Vec<String>,
    satisfied: AtomicBool,
    notify: Notify,
}

impl ActiveReplicaWatch {
    /// Evaluate against `state`; returns true once satisfied
    fn evaluate(&self, state: &ClusterState) -> bool {
        if self.satisfied.load(Ordering::Acquire) {
            return true;
        }
        if state.all_active(&self.collection, &self.cores) {
            self.satisfied.store(true, Ordering::Release);
            self.notify.notify_one();
            return true;
        }
        false
    }
}

/// Registry of active-replica watches, keyed by collection
#[derive(Default)]
pub struct WatcherRegistry {
    watches: Mutex<HashMap<String, HashMap<u64, Arc<ActiveReplicaWatch>>>>,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, collection: &str, cores: Vec<String>) -> WatchGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let watch = Arc::new(ActiveReplicaWatch {
            collection: collection.to_string(),
            cores,
            satisfied: AtomicBool::new(false),
            notify: Notify::new(),
        });

        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .insert(id, watch.clone());
        debug!(collection, id, "watch registered");

        WatchGuard {
            registry: self.clone(),
            id,
            watch,
        }
    }

    /// Remove a registration. Idempotent.
    pub fn unregister(&self, collection: &str, id: u64) -> bool {
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(by_id) = watches.get_mut(collection) else {
            return false;
        };
        let removed = by_id.remove(&id).is_some();
        if by_id.is_empty() {
            watches.remove(collection);
        }
        removed
    }

    /// Deliver a state change for `collection` to its watches.
    ///
    /// Watches are evaluated outside the registry lock.
    pub fn notify(&self, collection: &str, state: &ClusterState) {
        let targets: Vec<Arc<ActiveReplicaWatch>> = {
            let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            match watches.get(collection) {
                Some(by_id) => by_id.values().cloned().collect(),
                None => return,
            }
        };
        for watch in targets {
            watch.evaluate(state);
        }
    }

    /// Total live registrations
    pub fn len(&self) -> usize {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned registration; unregisters on drop
pub struct WatchGuard {
    registry: Arc<WatcherRegistry>,
    id: u64,
    watch: Arc<ActiveReplicaWatch>,
}

impl WatchGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_satisfied(&self) -> bool {
        self.watch.satisfied.load(Ordering::Acquire)
    }

    /// Evaluate against an explicit state (used right after registering)
    pub fn check(&self, state: &ClusterState) -> bool {
        self.watch.evaluate(state)
    }

    /// Block until satisfied or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        if self.is_satisfied() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.watch.notify.notified()).await {
            Ok(()) => Ok(()),
            // the flag may have flipped between the timer firing and now
            Err(_) if self.is_satisfied() => Ok(()),
            Err(_) => Err(Error::Timeout(format!(
                "Timeout waiting {} seconds for replica to become active",
                timeout.as_secs_f64()
            ))),
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.watch.collection, self.id);
        debug!(collection = %self.watch.collection, id = self.id, "watch unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::cluster_state::{
        ClusterStateStore, Collection, ReplicaState, ReplicaType,
    };
    use crate::coordinator::routing::Router;
    use crate::coordinator::state_queue::{AddReplicaMutation, Mutation};

    fn store_with_replica(core: &str) -> Arc<ClusterStateStore> {
        let store = Arc::new(ClusterStateStore::default());
        store
            .apply(&Mutation::CreateCollection(Collection::new(
                "books",
                "conf",
                Router::CompositeId,
                &["shard1".to_string()],
            )))
            .unwrap();
        store
            .apply(&Mutation::AddReplica(AddReplicaMutation {
                collection: "books".into(),
                shard: "shard1".into(),
                core: core.into(),
                state: ReplicaState::Down,
                base_url: "http://n1".into(),
                node_name: "n1".into(),
                replica_type: ReplicaType::Nrt,
                core_node_name: None,
            }))
            .unwrap();
        store
    }

    fn activate(store: &ClusterStateStore, core: &str) {
        store
            .apply(&Mutation::UpdateReplicaState {
                collection: "books".into(),
                core: core.into(),
                state: ReplicaState::Active,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_satisfied_by_notification() {
        let store = store_with_replica("c1");
        let guard = store.watch_active("books", vec!["c1".into()]);
        assert!(!guard.is_satisfied());
        assert_eq!(store.watchers().len(), 1);

        activate(&store, "c1");
        guard.wait(Duration::from_secs(1)).await.unwrap();
        drop(guard);
        assert!(store.watchers().is_empty());
    }

    #[tokio::test]
    async fn test_already_active_at_registration() {
        let store = store_with_replica("c1");
        activate(&store, "c1");
        let guard = store.watch_active("books", vec!["c1".into()]);
        assert!(guard.is_satisfied());
        guard.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_unregisters() {
        let store = store_with_replica("c1");
        {
            let guard = store.watch_active("books", vec!["c1".into()]);
            let err = guard.wait(Duration::from_millis(20)).await.unwrap_err();
            assert!(matches!(err, Error::Timeout(_)));
        }
        assert!(store.watchers().is_empty());
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = Arc::new(WatcherRegistry::new());
        let guard = registry.register("books", vec!["c1".into()]);
        let id = guard.id();
        assert!(registry.unregister("books", id));
        assert!(!registry.unregister("books", id));
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_leave_registry_empty() {
        let store = store_with_replica("c1");
        let mut tasks = Vec::new();
        for i in 0..100 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let guard = store.watch_active("books", vec!["c1".into()]);
                // odd waiters outlive the activation below, even ones time out first
                let timeout = if i % 2 == 0 { 5 } else { 2_000 };
                guard.wait(Duration::from_millis(timeout)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        activate(&store, "c1");

        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert!(store.watchers().is_empty());
    }
}
