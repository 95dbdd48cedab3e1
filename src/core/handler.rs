//! Downstream handler plugin and its instantiation policy.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What a handler decided about one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome<T> {
    Done,
    /// Put the item back at the tail of its queue.
    Retry(T),
}

#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// Consume one item. An `Err` is fatal for the worker that called it.
    async fn handle(&self, item: T) -> anyhow::Result<HandleOutcome<T>>;

    /// Called once when the router stops using this instance.
    async fn release(&self) {}
}

pub type HandlerFactory<T> = Arc<dyn Fn() -> Arc<dyn Handler<T>> + Send + Sync>;

/// How handler instances are shared between items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// One instance for the whole router.
    #[default]
    Singleton,
    /// One instance per queue name, released when the queue is removed.
    PerQueue,
    /// A fresh instance for every item.
    PerItem,
}

/// Resolves handler instances according to a [`HandlerMode`].
pub struct HandlerProvider<T> {
    factory: HandlerFactory<T>,
    singleton: Mutex<Option<Arc<dyn Handler<T>>>>,
    per_queue: DashMap<String, Arc<dyn Handler<T>>>,
}

impl<T: Send + 'static> HandlerProvider<T> {
    pub fn new(factory: HandlerFactory<T>) -> Self {
        Self {
            factory,
            singleton: Mutex::new(None),
            per_queue: DashMap::new(),
        }
    }

    pub fn resolve(&self, mode: HandlerMode, queue: &str) -> Arc<dyn Handler<T>> {
        match mode {
            HandlerMode::Singleton => {
                let mut singleton = self.singleton.lock();
                Arc::clone(singleton.get_or_insert_with(|| (self.factory)()))
            }
            HandlerMode::PerQueue => {
                if let Some(handler) = self.per_queue.get(queue) {
                    return Arc::clone(handler.value());
                }
                let entry = self
                    .per_queue
                    .entry(queue.to_string())
                    .or_insert_with(|| (self.factory)());
                Arc::clone(entry.value())
            }
            HandlerMode::PerItem => (self.factory)(),
        }
    }

    /// Take the cached per-queue instance for `queue`, if any.
    pub fn evict(&self, queue: &str) -> Option<Arc<dyn Handler<T>>> {
        self.per_queue.remove(queue).map(|(_, handler)| handler)
    }

    /// The cached per-queue instance for `queue`, left in place.
    pub fn cached(&self, queue: &str) -> Option<Arc<dyn Handler<T>>> {
        self.per_queue
            .get(queue)
            .map(|handler| Arc::clone(handler.value()))
    }

    /// Evict `queue`'s instance only if it is still `handler`; a queue that
    /// was re-created meanwhile keeps its new instance.
    pub fn evict_instance(&self, queue: &str, handler: &Arc<dyn Handler<T>>) -> bool {
        self.per_queue
            .remove_if(queue, |_, current| Arc::ptr_eq(current, handler))
            .is_some()
    }

    /// Take every cached instance, singleton included.
    pub fn evict_all(&self) -> Vec<Arc<dyn Handler<T>>> {
        let mut evicted: Vec<_> = self.singleton.lock().take().into_iter().collect();
        evicted.extend(self.evict_per_queue());
        evicted
    }

    /// Take every per-queue instance.
    pub fn evict_per_queue(&self) -> Vec<Arc<dyn Handler<T>>> {
        let names: Vec<String> = self.per_queue.iter().map(|e| e.key().clone()).collect();
        names.iter().filter_map(|name| self.evict(name)).collect()
    }

    pub fn cached_queues(&self) -> usize {
        self.per_queue.len()
    }
}
