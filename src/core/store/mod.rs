//! Durable transactional store port.
//!
//! The work manager never talks to a storage engine directly. Everything it
//! persists goes through [`Store`] transactions:
//! - per-key FIFO queues (`enqueue`, `try_dequeue`, `count`)
//! - a string-keyed registry of queue names (`contains_key`, `add_key`, ...)
//!
//! Operations inside one transaction are atomic. Dropping a transaction
//! without calling [`Transaction::commit`] rolls it back. A
//! [`StoreError::Timeout`] means lock contention, not failure.
//!
//! [`MemoryStore`] is the bundled implementation; it can journal committed
//! transactions to disk so queues survive a restart.

pub mod journal;
pub mod memory;

pub use journal::{Journal, JournalConfig, JournalError};
pub use memory::{MemoryStore, MemoryStoreConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::item::WorkItem;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A lock could not be acquired in time. Callers treat this as benign
    /// contention and retry later.
    #[error("timed out after {waited:?} waiting for '{resource}'")]
    Timeout { resource: String, waited: Duration },

    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

/// One atomic unit of work against the store.
#[async_trait]
pub trait Transaction<T: WorkItem>: Send {
    /// Append an item to the tail of a queue.
    async fn enqueue(&mut self, queue: &str, item: T) -> Result<(), StoreError>;

    /// Take the head of a queue, waiting at most `timeout` for its lock.
    ///
    /// Returns `Ok(None)` when the queue is empty.
    async fn try_dequeue(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<T>, StoreError>;

    /// Number of items in a queue as seen by this transaction.
    async fn count(&mut self, queue: &str) -> Result<usize, StoreError>;

    /// Create a queue. Creating a queue that already exists is a no-op.
    async fn create_queue(&mut self, queue: &str) -> Result<(), StoreError>;

    /// Drop a queue together with any items it still holds.
    async fn drop_queue(&mut self, queue: &str) -> Result<(), StoreError>;

    async fn contains_key(&mut self, key: &str) -> Result<bool, StoreError>;

    async fn add_key(&mut self, key: &str) -> Result<(), StoreError>;

    /// Remove a registry key. Returns `false` when the key was absent.
    async fn try_remove_key(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Every registry key, in sorted order.
    async fn keys(&mut self) -> Result<Vec<String>, StoreError>;

    /// Make every operation of this transaction durable and visible.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Factory for transactions.
#[async_trait]
pub trait Store<T: WorkItem>: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction<T>>, StoreError>;
}

/// Handle to one durable per-key queue.
///
/// The handle carries no state beyond the queue name; a queue that was
/// dropped and re-created under the same name is reached through an equal
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableQueue {
    name: Arc<str>,
}

impl DurableQueue {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue<T: WorkItem>(
        &self,
        tx: &mut dyn Transaction<T>,
        item: T,
    ) -> Result<(), StoreError> {
        tx.enqueue(&self.name, item).await
    }

    pub async fn try_dequeue<T: WorkItem>(
        &self,
        tx: &mut dyn Transaction<T>,
        timeout: Duration,
    ) -> Result<Option<T>, StoreError> {
        tx.try_dequeue(&self.name, timeout).await
    }

    pub async fn count<T: WorkItem>(
        &self,
        tx: &mut dyn Transaction<T>,
    ) -> Result<usize, StoreError> {
        tx.count(&self.name).await
    }
}
