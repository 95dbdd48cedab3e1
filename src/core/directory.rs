//! Directory of per-key queues and the claim pool that hands them out.
//!
//! Every known queue name is in exactly one of two places: the FIFO claim
//! pool, or the hands of the one worker that took it. A worker that takes a
//! name has exclusive use of that queue until it returns the claim or
//! removes the queue.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use crate::core::item::WorkItem;
use crate::core::store::{DurableQueue, Store, StoreError, Transaction};
use crate::metrics;

/// What [`QueueDirectory::recover`] found in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub queues: usize,
    pub items: usize,
}

pub struct QueueDirectory<T> {
    store: Arc<dyn Store<T>>,
    queues: DashMap<String, DurableQueue>,
    pool: SegQueue<String>,
    /// Names currently sitting in `pool`.
    pooled: DashSet<String>,
    suspects: DashMap<String, Instant>,
}

impl<T: WorkItem> QueueDirectory<T> {
    pub fn new(store: Arc<dyn Store<T>>) -> Self {
        Self {
            store,
            queues: DashMap::new(),
            pool: SegQueue::new(),
            pooled: DashSet::new(),
            suspects: DashMap::new(),
        }
    }

    pub async fn begin(&self) -> Result<Box<dyn Transaction<T>>, StoreError> {
        self.store.begin().await
    }

    /// Look up the queue for `name`, creating and registering it if needed.
    ///
    /// A newly created queue is put in the claim pool.
    pub async fn get_or_create(&self, name: &str) -> Result<DurableQueue, StoreError> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.value().clone());
        }

        let mut tx = self.store.begin().await?;
        let created = if tx.contains_key(name).await? {
            false
        } else {
            tx.create_queue(name).await?;
            tx.add_key(name).await?;
            true
        };
        tx.commit().await?;

        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| DurableQueue::new(name))
            .value()
            .clone();

        if created {
            metrics::inc_queues_created(1);
            debug!(target: "keyrouter::directory", queue = %name, "queue created");
            self.return_claim(name);
        }
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<DurableQueue> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    /// Take the oldest available claim. `None` when every queue is taken.
    pub fn take_claim(&self) -> Option<(String, DurableQueue)> {
        while let Some(name) = self.pool.pop() {
            self.pooled.remove(&name);
            if let Some(queue) = self.get(&name) {
                return Some((name, queue));
            }
            debug!(target: "keyrouter::directory", queue = %name, "skipping stale claim");
        }
        None
    }

    /// Put a claim back at the tail of the pool.
    pub fn return_claim(&self, name: &str) {
        if self.pooled.insert(name.to_string()) {
            self.pool.push(name.to_string());
        }
    }

    /// Unregister and drop an empty queue.
    ///
    /// Returns `Ok(false)` without changing anything when the queue turns out
    /// to hold items. The caller must hold the queue's claim.
    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;

        // Registry first, then the queue.
        let registered = tx.contains_key(name).await?;
        let depth = match tx.count(name).await {
            Ok(depth) => depth,
            Err(StoreError::QueueNotFound(_)) => 0,
            Err(err) => return Err(err),
        };
        if depth > 0 {
            return Ok(false);
        }

        if registered {
            tx.try_remove_key(name).await?;
        }
        match tx.drop_queue(name).await {
            Ok(()) | Err(StoreError::QueueNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        // Unmapped before the registry lock is released, so a concurrent
        // creator never sees the old entry.
        let unmapped = self.queues.remove(name);
        if let Err(err) = tx.commit().await {
            if let Some((name, queue)) = unmapped {
                self.queues.insert(name, queue);
            }
            return Err(err);
        }

        self.suspects.remove(name);
        metrics::inc_queues_removed(1);
        debug!(target: "keyrouter::directory", queue = %name, "queue removed");
        Ok(true)
    }

    /// Rebuild the in-memory view from the persisted registry.
    pub async fn recover(&self) -> Result<RecoveredState, StoreError> {
        let mut tx = self.store.begin().await?;
        let names = tx.keys().await?;

        let mut state = RecoveredState::default();
        for name in &names {
            tx.create_queue(name).await?;
            state.items += tx.count(name).await?;
            state.queues += 1;
        }
        tx.commit().await?;

        for name in names {
            self.queues
                .entry(name.clone())
                .or_insert_with(|| DurableQueue::new(name.as_str()));
            self.return_claim(&name);
        }

        info!(
            target: "keyrouter::directory",
            queues = state.queues,
            items = state.items,
            "queue directory recovered"
        );
        Ok(state)
    }

    pub fn count(&self) -> usize {
        self.queues.len()
    }

    /// Known queue names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn available_claims(&self) -> usize {
        self.pool.len()
    }

    /// Mark `name` as seen empty. An existing suspicion keeps its timestamp.
    pub fn suspect(&self, name: &str, now: Instant) -> Instant {
        *self.suspects.entry(name.to_string()).or_insert(now).value()
    }

    pub fn clear_suspicion(&self, name: &str) {
        self.suspects.remove(name);
    }

    pub fn suspected_since(&self, name: &str) -> Option<Instant> {
        self.suspects.get(name).map(|entry| *entry.value())
    }
}
