//! In-memory [`Store`] with per-queue locks and an optional journal.
//!
//! Each queue has two async locks and its item deque:
//! - the head lock, taken by `try_dequeue` and held until the transaction
//!   commits or is dropped, so two consumers never interleave on one queue
//! - the tail gate, taken for the short span in which appends are applied,
//!   and held by `count` and `drop_queue` until the transaction ends
//!
//! Enqueues are buffered in the transaction and appended at commit under the
//! tail gate only, so a producer never waits for a consumer that is holding
//! the head. The name registry has one lock of its own. Lock order is
//! registry, then head, then tail gate.
//!
//! Dequeues and queue drops apply in place and are recorded in an undo log;
//! dropping an uncommitted transaction replays the undo log in reverse. When
//! a journal is attached, commit writes the transaction's operations as one
//! record before any buffered append becomes visible, so every item's
//! enqueue record precedes its dequeue record.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::journal::{Journal, JournalConfig};
use super::{Store, StoreError, Transaction};
use crate::core::item::WorkItem;

const REGISTRY: &str = "<registry>";

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How long non-dequeue operations wait for a lock before timing out.
    pub lock_timeout: Duration,
    /// Rewrite the journal as a compact snapshot after replaying it.
    pub compact_on_open: bool,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(4),
            compact_on_open: true,
        }
    }
}

/// One committed mutation, as written to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalOp<T> {
    CreateQueue(String),
    DropQueue(String),
    Enqueue(String, T),
    Dequeue(String),
    AddKey(String),
    RemoveKey(String),
}

struct QueueItems<T> {
    items: VecDeque<T>,
    /// Set once the queue is dropped; holders of a stale slot must re-resolve.
    dropped: bool,
}

struct QueueSlot<T> {
    head: Arc<Mutex<()>>,
    gate: Arc<Mutex<()>>,
    state: parking_lot::Mutex<QueueItems<T>>,
}

impl<T> QueueSlot<T> {
    fn new(items: VecDeque<T>) -> Self {
        Self {
            head: Arc::new(Mutex::new(())),
            gate: Arc::new(Mutex::new(())),
            state: parking_lot::Mutex::new(QueueItems {
                items,
                dropped: false,
            }),
        }
    }

    fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }
}

type SlotRef<T> = Arc<QueueSlot<T>>;

struct Shared<T> {
    queues: DashMap<String, SlotRef<T>>,
    registry: Arc<Mutex<BTreeSet<String>>>,
    journal: Option<Journal>,
    config: MemoryStoreConfig,
    next_tx: AtomicU64,
}

/// In-memory transactional store.
pub struct MemoryStore<T> {
    shared: Arc<Shared<T>>,
}

impl<T: WorkItem> MemoryStore<T> {
    /// A volatile store; nothing survives the process.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self::from_parts(BTreeSet::new(), HashMap::new(), None, config)
    }

    /// Open a journaled store, replaying whatever the journal at `path` holds.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        config: MemoryStoreConfig,
        journal_config: JournalConfig,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let records = Journal::read_records(path).await?;

        let mut registry = BTreeSet::new();
        let mut queues: HashMap<String, VecDeque<T>> = HashMap::new();
        for record in &records {
            let ops: Vec<JournalOp<T>> = bincode::deserialize(&record.payload)
                .map_err(|err| StoreError::Codec(err.to_string()))?;
            for op in ops {
                replay(&mut registry, &mut queues, op);
            }
        }

        let items: usize = queues.values().map(VecDeque::len).sum();
        info!(
            target: "keyrouter::store",
            path = %path.display(),
            records = records.len(),
            queues = queues.len(),
            items,
            "journal replayed"
        );

        if config.compact_on_open && !records.is_empty() {
            let snapshot = encode(&snapshot_ops(&registry, &queues))?;
            Journal::rewrite(path, &[snapshot]).await?;
            debug!(target: "keyrouter::store", "journal compacted to one snapshot record");
        }

        let journal = Journal::open(path, journal_config).await?;
        Ok(Self::from_parts(registry, queues, Some(journal), config))
    }

    fn from_parts(
        registry: BTreeSet<String>,
        queues: HashMap<String, VecDeque<T>>,
        journal: Option<Journal>,
        config: MemoryStoreConfig,
    ) -> Self {
        let slots = DashMap::new();
        for (name, items) in queues {
            slots.insert(name, Arc::new(QueueSlot::new(items)));
        }
        Self {
            shared: Arc::new(Shared {
                queues: slots,
                registry: Arc::new(Mutex::new(registry)),
                journal,
                config,
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Flush the journal, if any.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if let Some(journal) = &self.shared.journal {
            journal.flush().await?;
        }
        Ok(())
    }
}

impl<T: WorkItem> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: WorkItem> Store<T> for MemoryStore<T> {
    async fn begin(&self) -> Result<Box<dyn Transaction<T>>, StoreError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            id,
            shared: Arc::clone(&self.shared),
            held: HashMap::new(),
            registry: None,
            appends: Vec::new(),
            undo: Vec::new(),
            redo: Vec::new(),
            committed: false,
        }))
    }
}

/// Locks a transaction holds on one queue.
struct Held<T> {
    slot: SlotRef<T>,
    head: Option<OwnedMutexGuard<()>>,
    gate: Option<OwnedMutexGuard<()>>,
}

impl<T> Held<T> {
    fn new(slot: SlotRef<T>) -> Self {
        Self {
            slot,
            head: None,
            gate: None,
        }
    }
}

enum Undo<T> {
    PushFront(SlotRef<T>, T),
    Uncreate(String, SlotRef<T>),
    Undrop(String, SlotRef<T>, VecDeque<T>),
    RemoveKey(String),
    AddKey(String),
}

pub struct MemoryTransaction<T: WorkItem> {
    id: u64,
    shared: Arc<Shared<T>>,
    held: HashMap<String, Held<T>>,
    registry: Option<OwnedMutexGuard<BTreeSet<String>>>,
    /// Enqueues applied at commit.
    appends: Vec<(String, SlotRef<T>, T)>,
    undo: Vec<Undo<T>>,
    redo: Vec<JournalOp<T>>,
    committed: bool,
}

async fn acquire(
    lock: &Arc<Mutex<()>>,
    resource: &str,
    timeout: Duration,
) -> Result<OwnedMutexGuard<()>, StoreError> {
    tokio::time::timeout(timeout, Arc::clone(lock).lock_owned())
        .await
        .map_err(|_| StoreError::Timeout {
            resource: resource.to_string(),
            waited: timeout,
        })
}

impl<T: WorkItem> MemoryTransaction<T> {
    fn journaled(&self) -> bool {
        self.shared.journal.is_some()
    }

    fn slot(&self, name: &str) -> Result<SlotRef<T>, StoreError> {
        if let Some(held) = self.held.get(name) {
            return Ok(Arc::clone(&held.slot));
        }
        self.shared
            .queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::QueueNotFound(name.to_string()))
    }

    async fn hold_head(&mut self, name: &str, timeout: Duration) -> Result<SlotRef<T>, StoreError> {
        let slot = self.slot(name)?;
        let held = self
            .held
            .entry(name.to_string())
            .or_insert_with(|| Held::new(Arc::clone(&slot)));
        if held.head.is_none() {
            held.head = Some(acquire(&slot.head, name, timeout).await?);
        }
        if slot.is_dropped() {
            return Err(StoreError::QueueNotFound(name.to_string()));
        }
        Ok(slot)
    }

    async fn hold_gate(&mut self, name: &str, timeout: Duration) -> Result<SlotRef<T>, StoreError> {
        let slot = self.slot(name)?;
        let held = self
            .held
            .entry(name.to_string())
            .or_insert_with(|| Held::new(Arc::clone(&slot)));
        if held.gate.is_none() {
            held.gate = Some(acquire(&slot.gate, name, timeout).await?);
        }
        if slot.is_dropped() {
            return Err(StoreError::QueueNotFound(name.to_string()));
        }
        Ok(slot)
    }

    /// Whether this transaction already holds the tail gate of `slot`.
    fn holds_gate(&self, slot: &SlotRef<T>) -> bool {
        self.held
            .values()
            .any(|held| held.gate.is_some() && Arc::ptr_eq(&held.slot, slot))
    }

    async fn lock_registry(&mut self) -> Result<&mut BTreeSet<String>, StoreError> {
        if self.registry.is_none() {
            let timeout = self.shared.config.lock_timeout;
            let guard = tokio::time::timeout(
                timeout,
                Arc::clone(&self.shared.registry).lock_owned(),
            )
            .await
            .map_err(|_| StoreError::Timeout {
                resource: REGISTRY.to_string(),
                waited: timeout,
            })?;
            self.registry = Some(guard);
        }

        match self.registry.as_mut() {
            Some(guard) => Ok(&mut **guard),
            None => Err(StoreError::Timeout {
                resource: REGISTRY.to_string(),
                waited: Duration::ZERO,
            }),
        }
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::PushFront(slot, item) => {
                    slot.state.lock().items.push_front(item);
                }
                Undo::Uncreate(name, slot) => {
                    slot.state.lock().dropped = true;
                    self.shared
                        .queues
                        .remove_if(&name, |_, current| Arc::ptr_eq(current, &slot));
                }
                Undo::Undrop(name, slot, items) => {
                    {
                        let mut state = slot.state.lock();
                        state.items = items;
                        state.dropped = false;
                    }
                    self.shared.queues.entry(name).or_insert(slot);
                }
                Undo::RemoveKey(key) => {
                    if let Some(registry) = self.registry.as_mut() {
                        registry.remove(&key);
                    }
                }
                Undo::AddKey(key) => {
                    if let Some(registry) = self.registry.as_mut() {
                        registry.insert(key);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<T: WorkItem> Transaction<T> for MemoryTransaction<T> {
    async fn enqueue(&mut self, queue: &str, item: T) -> Result<(), StoreError> {
        let slot = self.slot(queue)?;
        if slot.is_dropped() {
            return Err(StoreError::QueueNotFound(queue.to_string()));
        }

        if self.journaled() {
            self.redo
                .push(JournalOp::Enqueue(queue.to_string(), item.clone()));
        }
        self.appends.push((queue.to_string(), slot, item));
        Ok(())
    }

    async fn try_dequeue(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<T>, StoreError> {
        let slot = self.hold_head(queue, timeout).await?;
        let popped = slot.state.lock().items.pop_front();
        let Some(item) = popped else {
            return Ok(None);
        };

        self.undo.push(Undo::PushFront(slot, item.clone()));
        if self.journaled() {
            self.redo.push(JournalOp::Dequeue(queue.to_string()));
        }
        Ok(Some(item))
    }

    async fn count(&mut self, queue: &str) -> Result<usize, StoreError> {
        let timeout = self.shared.config.lock_timeout;
        self.hold_head(queue, timeout).await?;
        let slot = self.hold_gate(queue, timeout).await?;

        let pending = self
            .appends
            .iter()
            .filter(|(_, target, _)| Arc::ptr_eq(target, &slot))
            .count();
        let stored = slot.state.lock().items.len();
        Ok(stored + pending)
    }

    async fn create_queue(&mut self, queue: &str) -> Result<(), StoreError> {
        if let Ok(existing) = self.slot(queue) {
            if !existing.is_dropped() {
                return Ok(());
            }
        }

        let slot: SlotRef<T> = Arc::new(QueueSlot::new(VecDeque::new()));
        // Fresh and unshared, so neither can block.
        let head = Arc::clone(&slot.head).lock_owned().await;
        let gate = Arc::clone(&slot.gate).lock_owned().await;
        self.shared
            .queues
            .insert(queue.to_string(), Arc::clone(&slot));
        self.held.insert(
            queue.to_string(),
            Held {
                slot: Arc::clone(&slot),
                head: Some(head),
                gate: Some(gate),
            },
        );

        self.undo.push(Undo::Uncreate(queue.to_string(), slot));
        if self.journaled() {
            self.redo.push(JournalOp::CreateQueue(queue.to_string()));
        }
        Ok(())
    }

    async fn drop_queue(&mut self, queue: &str) -> Result<(), StoreError> {
        let timeout = self.shared.config.lock_timeout;
        self.hold_head(queue, timeout).await?;
        let slot = self.hold_gate(queue, timeout).await?;

        let items = {
            let mut state = slot.state.lock();
            state.dropped = true;
            std::mem::take(&mut state.items)
        };
        self.shared
            .queues
            .remove_if(queue, |_, current| Arc::ptr_eq(current, &slot));

        self.undo
            .push(Undo::Undrop(queue.to_string(), slot, items));
        if self.journaled() {
            self.redo.push(JournalOp::DropQueue(queue.to_string()));
        }
        Ok(())
    }

    async fn contains_key(&mut self, key: &str) -> Result<bool, StoreError> {
        let registry = self.lock_registry().await?;
        Ok(registry.contains(key))
    }

    async fn add_key(&mut self, key: &str) -> Result<(), StoreError> {
        let registry = self.lock_registry().await?;
        if registry.insert(key.to_string()) {
            self.undo.push(Undo::RemoveKey(key.to_string()));
            if self.journaled() {
                self.redo.push(JournalOp::AddKey(key.to_string()));
            }
        }
        Ok(())
    }

    async fn try_remove_key(&mut self, key: &str) -> Result<bool, StoreError> {
        let registry = self.lock_registry().await?;
        if !registry.remove(key) {
            return Ok(false);
        }
        self.undo.push(Undo::AddKey(key.to_string()));
        if self.journaled() {
            self.redo.push(JournalOp::RemoveKey(key.to_string()));
        }
        Ok(true)
    }

    async fn keys(&mut self) -> Result<Vec<String>, StoreError> {
        let registry = self.lock_registry().await?;
        Ok(registry.iter().cloned().collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let timeout = this.shared.config.lock_timeout;

        // Gates of every append target, in name order.
        let mut targets: Vec<(String, SlotRef<T>)> = Vec::new();
        for (name, slot, _) in &this.appends {
            if !targets.iter().any(|(_, seen)| Arc::ptr_eq(seen, slot)) {
                targets.push((name.clone(), Arc::clone(slot)));
            }
        }
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut gates = Vec::with_capacity(targets.len());
        for (name, slot) in &targets {
            if !this.holds_gate(slot) {
                gates.push(acquire(&slot.gate, name, timeout).await?);
            }
            if slot.is_dropped() {
                // Removed since the enqueue; nothing was applied.
                return Err(StoreError::QueueNotFound(name.clone()));
            }
        }

        if let Some(journal) = &this.shared.journal {
            if !this.redo.is_empty() {
                let payload = encode(&this.redo)?;
                // On failure the drop rolls the transaction back.
                journal.append(payload).await?;
            }
        }

        for (_, slot, item) in this.appends.drain(..) {
            slot.state.lock().items.push_back(item);
        }
        drop(gates);

        this.committed = true;
        this.undo.clear();
        Ok(())
    }
}

impl<T: WorkItem> Drop for MemoryTransaction<T> {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            debug!(
                target: "keyrouter::store",
                tx = self.id,
                steps = self.undo.len(),
                "rolling back transaction"
            );
            self.rollback();
        }
    }
}

fn encode<T: WorkItem>(ops: &[JournalOp<T>]) -> Result<Bytes, StoreError> {
    bincode::serialize(ops)
        .map(Bytes::from)
        .map_err(|err| StoreError::Codec(err.to_string()))
}

fn replay<T>(
    registry: &mut BTreeSet<String>,
    queues: &mut HashMap<String, VecDeque<T>>,
    op: JournalOp<T>,
) {
    match op {
        JournalOp::CreateQueue(name) => {
            queues.entry(name).or_default();
        }
        JournalOp::DropQueue(name) => {
            queues.remove(&name);
        }
        JournalOp::Enqueue(name, item) => {
            queues.entry(name).or_default().push_back(item);
        }
        JournalOp::Dequeue(name) => {
            let popped = queues.get_mut(&name).and_then(VecDeque::pop_front);
            if popped.is_none() {
                warn!(target: "keyrouter::store", queue = %name, "journal dequeue on empty queue");
            }
        }
        JournalOp::AddKey(key) => {
            registry.insert(key);
        }
        JournalOp::RemoveKey(key) => {
            registry.remove(&key);
        }
    }
}

fn snapshot_ops<T: Clone>(
    registry: &BTreeSet<String>,
    queues: &HashMap<String, VecDeque<T>>,
) -> Vec<JournalOp<T>> {
    let mut ops = Vec::new();
    for key in registry {
        ops.push(JournalOp::AddKey(key.clone()));
    }
    for (name, items) in queues {
        ops.push(JournalOp::CreateQueue(name.clone()));
        for item in items {
            ops.push(JournalOp::Enqueue(name.clone(), item.clone()));
        }
    }
    ops
}
