#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keyrouter::{
    HandleOutcome, Handler, HandlerFactory, MemoryStore, Store, WorkItem, WorkManager,
    WorkManagerConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = keyrouter::logging::init_logging();
    });
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    pub device: String,
    pub seq: u64,
}

impl WorkItem for Reading {
    fn queue_name(&self) -> &str {
        &self.device
    }
}

pub fn reading(device: &str, seq: u64) -> Reading {
    Reading {
        device: device.to_string(),
        seq,
    }
}

/// Timings short enough for tests.
pub fn fast_config() -> WorkManagerConfig {
    WorkManagerConfig {
        max_workers: 4,
        no_queue_backoff_ms: 5,
        pause_poll_interval_ms: 5,
        drain_poll_interval_ms: 5,
        contended_dequeue_timeout_ms: 5,
        uncontended_dequeue_timeout_ms: 50,
        telemetry_trim_interval_ms: 50,
        ..Default::default()
    }
}

pub fn factory_for<H>(handler: Arc<H>) -> HandlerFactory<Reading>
where
    H: Handler<Reading> + 'static,
{
    Arc::new(move || Arc::clone(&handler) as Arc<dyn Handler<Reading>>)
}

pub fn manager<H>(config: WorkManagerConfig, handler: Arc<H>) -> WorkManager<Reading>
where
    H: Handler<Reading> + 'static,
{
    let store: Arc<dyn Store<Reading>> = Arc::new(MemoryStore::<Reading>::new());
    WorkManager::new(store, factory_for(handler), config).unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Records every handled item and flags two workers inside one queue.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Reading>>,
    in_flight: Mutex<HashSet<String>>,
    pub overlapped: AtomicBool,
    pub delay: Option<Duration>,
    pub released: AtomicUsize,
}

impl Recorder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn sequence_of(&self, device: &str) -> Vec<u64> {
        self.seen
            .lock()
            .iter()
            .filter(|r| r.device == device)
            .map(|r| r.seq)
            .collect()
    }
}

#[async_trait]
impl Handler<Reading> for Recorder {
    async fn handle(&self, item: Reading) -> anyhow::Result<HandleOutcome<Reading>> {
        if !self.in_flight.lock().insert(item.device.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.lock().remove(&item.device);
        self.seen.lock().push(item);
        Ok(HandleOutcome::Done)
    }

    async fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
