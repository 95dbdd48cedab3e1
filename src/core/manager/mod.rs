//! Public entry point: posting work, lifecycle control, status.

pub(crate) mod pool;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkManagerConfig;
use crate::core::deferred::DeferredTaskRunner;
use crate::core::directory::QueueDirectory;
use crate::core::error::{RouterError, WorkerFailure};
use crate::core::handler::{HandlerFactory, HandlerProvider};
use crate::core::item::WorkItem;
use crate::core::state::WorkState;
use crate::core::store::{Store, StoreError};
use crate::core::telemetry::{ClickKind, Telemetry};
use crate::core::worker::Worker;
use crate::metrics;

/// Attempts `post` makes when its queue is removed underneath it or a lock
/// stays contended.
const POST_ATTEMPTS: usize = 8;

const FAILURE_BACKLOG: usize = 1024;

/// Point-in-time view of a work manager.
#[derive(Debug, Clone, Serialize)]
pub struct WorkStatus {
    pub state: WorkState,
    pub queues: usize,
    pub executors: usize,
    pub buffered: usize,
    pub max_workers: usize,
    pub max_buffered_items: usize,
    pub posted_last_minute: u64,
    pub processed_last_minute: u64,
    pub posted_last_hour: u64,
    pub processed_last_hour: u64,
    pub average_posted_per_min_last_hour: f64,
    pub average_processed_per_min_last_hour: f64,
}

/// State shared between the manager, its workers and its deferred tasks.
pub(crate) struct Shared<T: WorkItem> {
    pub(crate) directory: QueueDirectory<T>,
    pub(crate) handlers: HandlerProvider<T>,
    config: ArcSwap<WorkManagerConfig>,
    pub(crate) buffered: AtomicUsize,
    pub(crate) telemetry: Telemetry,
    pub(crate) deferred: DeferredTaskRunner,
    pub(crate) executors: DashMap<u64, Worker>,
    pub(crate) next_worker: AtomicU64,
    state: AtomicU8,
    failures_tx: flume::Sender<WorkerFailure>,
    failures_rx: flume::Receiver<WorkerFailure>,
}

impl<T: WorkItem> Shared<T> {
    pub(crate) fn config(&self) -> Arc<WorkManagerConfig> {
        self.config.load_full()
    }

    pub(crate) fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Queue a failure record; the oldest unread record is dropped when the
    /// backlog is full.
    pub(crate) fn report_failure(&self, failure: WorkerFailure) {
        if let Err(flume::TrySendError::Full(failure)) = self.failures_tx.try_send(failure) {
            let _ = self.failures_rx.try_recv();
            let _ = self.failures_tx.try_send(failure);
        }
    }
}

/// Routes posted items into per-key queues and drains them with an elastic
/// pool of workers.
pub struct WorkManager<T: WorkItem> {
    shared: Arc<Shared<T>>,
    /// Serializes lifecycle transitions.
    control: Mutex<()>,
    trim_shutdown: watch::Sender<bool>,
    trimmers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: WorkItem> WorkManager<T> {
    pub fn new(
        store: Arc<dyn Store<T>>,
        factory: HandlerFactory<T>,
        config: WorkManagerConfig,
    ) -> Result<Self, RouterError> {
        let config = config.validated()?;
        let (failures_tx, failures_rx) = flume::bounded(FAILURE_BACKLOG);
        let (trim_shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                directory: QueueDirectory::new(store),
                handlers: HandlerProvider::new(factory),
                config: ArcSwap::from_pointee(config),
                buffered: AtomicUsize::new(0),
                telemetry: Telemetry::new(),
                deferred: DeferredTaskRunner::new(),
                executors: DashMap::new(),
                next_worker: AtomicU64::new(1),
                state: AtomicU8::new(WorkState::New as u8),
                failures_tx,
                failures_rx,
            }),
            control: Mutex::new(()),
            trim_shutdown,
            trimmers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Recover persisted queues and start working. Only legal from `New`.
    pub async fn start(&self) -> Result<(), RouterError> {
        let _guard = self.control.lock().await;
        let state = self.state();
        if state != WorkState::New {
            return Err(RouterError::InvalidState {
                operation: "start",
                state,
            });
        }

        let shared = &self.shared;
        let recovered = shared.directory.recover().await?;
        shared.buffered.store(recovered.items, Ordering::SeqCst);

        let config = shared.config();
        shared.deferred.start();
        let trimmers = shared.telemetry.spawn_trimmers(
            config.telemetry_trim_interval(),
            self.trim_shutdown.subscribe(),
        );
        self.trimmers.lock().extend(trimmers);

        shared.set_state(WorkState::Working);
        for _ in 0..recovered.queues.min(config.max_workers) {
            pool::schedule_grow(shared);
        }

        info!(
            target: "keyrouter::manager",
            queues = recovered.queues,
            buffered = recovered.items,
            max_workers = config.max_workers,
            "work manager started"
        );
        Ok(())
    }

    /// Durably enqueue `item` on the queue named by its key.
    pub async fn post(&self, item: T) -> Result<(), RouterError> {
        let state = self.state();
        if state != WorkState::Working {
            return Err(RouterError::NotWorking(state));
        }

        let limit = self.shared.config().max_buffered_items;
        self.shared
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| RouterError::Capacity { limit })?;

        if let Err(err) = self.enqueue(item).await {
            let _ = self
                .shared
                .buffered
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(1))
                });
            return Err(err);
        }

        self.shared.telemetry.record(ClickKind::Posted, 1);
        pool::schedule_grow(&self.shared);
        Ok(())
    }

    async fn enqueue(&self, item: T) -> Result<(), RouterError> {
        let directory = &self.shared.directory;
        let name = item.queue_name().to_string();

        let mut last = StoreError::QueueNotFound(name.clone());
        for attempt in 1..=POST_ATTEMPTS {
            let queue = match directory.get_or_create(&name).await {
                Ok(queue) => queue,
                Err(err) if err.is_timeout() => {
                    last = err;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let mut tx = directory.begin().await?;
            let appended = match queue.enqueue(tx.as_mut(), item.clone()).await {
                Ok(()) => tx.commit().await,
                Err(err) => Err(err),
            };
            match appended {
                Ok(()) => return Ok(()),
                Err(err @ StoreError::QueueNotFound(_)) | Err(err @ StoreError::Timeout { .. }) => {
                    debug!(
                        target: "keyrouter::manager",
                        queue = %name,
                        attempt,
                        error = %err,
                        "enqueue raced a removal or lock holder; resolving again"
                    );
                    last = err;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last.into())
    }

    pub async fn pause(&self) -> Result<(), RouterError> {
        let _guard = self.control.lock().await;
        let state = self.state();
        if state != WorkState::Working {
            return Err(RouterError::InvalidState {
                operation: "pause",
                state,
            });
        }

        self.shared.set_state(WorkState::Paused);
        for worker in self.shared.executors.iter() {
            worker.pause();
        }
        info!(target: "keyrouter::manager", "work manager paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), RouterError> {
        let _guard = self.control.lock().await;
        let state = self.state();
        if state != WorkState::Paused {
            return Err(RouterError::InvalidState {
                operation: "resume",
                state,
            });
        }

        self.resume_workers();
        info!(target: "keyrouter::manager", "work manager resumed");
        Ok(())
    }

    fn resume_workers(&self) {
        self.shared.set_state(WorkState::Working);
        for worker in self.shared.executors.iter() {
            worker.resume();
        }
    }

    /// Stop every worker and wait for each to exit. Queued items stay in
    /// the store.
    pub async fn stop(&self) -> Result<(), RouterError> {
        let _guard = self.control.lock().await;
        let state = self.state();
        if !state.is_active() {
            return Err(RouterError::InvalidState {
                operation: "stop",
                state,
            });
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting posts, let the workers empty every queue, then stop.
    pub async fn drain_and_stop(&self) -> Result<(), RouterError> {
        {
            let _guard = self.control.lock().await;
            let state = self.state();
            match state {
                WorkState::Working => {}
                WorkState::Paused => self.resume_workers(),
                _ => {
                    return Err(RouterError::InvalidState {
                        operation: "drain",
                        state,
                    })
                }
            }
            self.shared.set_state(WorkState::Draining);
            info!(
                target: "keyrouter::manager",
                buffered = self.buffered_count(),
                "draining"
            );
        }

        loop {
            if self.state() != WorkState::Draining {
                // Stopped by someone else meanwhile.
                return Ok(());
            }
            if self.buffered_count() == 0 {
                break;
            }
            tokio::time::sleep(self.shared.config().drain_poll_interval()).await;
        }

        let _guard = self.control.lock().await;
        if self.state() == WorkState::Draining {
            self.shutdown().await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let shared = &self.shared;

        // No resize may run once the workers are being stopped.
        shared.deferred.stop().await;

        let ids: Vec<u64> = shared.executors.iter().map(|entry| *entry.key()).collect();
        let workers: Vec<Worker> = ids
            .into_iter()
            .filter_map(|id| shared.executors.remove(&id).map(|(_, worker)| worker))
            .collect();
        futures::future::join_all(workers.iter().map(|worker| worker.stop())).await;
        metrics::inc_workers_stopped(workers.len() as u64);

        let _ = self.trim_shutdown.send(true);
        let trimmers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.trimmers.lock());
        for handle in trimmers {
            if let Err(err) = handle.await {
                warn!(target: "keyrouter::manager", error = %err, "telemetry trimmer panicked");
            }
        }

        for handler in shared.handlers.evict_all() {
            handler.release().await;
        }

        shared.set_state(WorkState::Stopped);
        info!(
            target: "keyrouter::manager",
            workers = workers.len(),
            buffered = self.buffered_count(),
            "work manager stopped"
        );
    }

    /// Publish a new configuration snapshot.
    ///
    /// The handler mode can only change while the manager is not `Working`.
    pub async fn update_config(&self, config: WorkManagerConfig) -> Result<(), RouterError> {
        let _guard = self.control.lock().await;
        let config = config.validated()?;
        let current = self.shared.config();
        let state = self.state();

        let mode_changed = config.handler_mode != current.handler_mode;
        if mode_changed && state == WorkState::Working {
            return Err(RouterError::InvalidState {
                operation: "change handler mode",
                state,
            });
        }

        self.shared.config.store(Arc::new(config));
        if mode_changed {
            for handler in self.shared.handlers.evict_per_queue() {
                handler.release().await;
            }
        }
        if state.is_active() {
            pool::schedule_grow(&self.shared);
            pool::schedule_shrink(&self.shared);
        }
        debug!(target: "keyrouter::manager", "configuration updated");
        Ok(())
    }

    pub fn config(&self) -> Arc<WorkManagerConfig> {
        self.shared.config()
    }

    pub fn state(&self) -> WorkState {
        self.shared.state()
    }

    /// Receiver of records for workers that died on a fatal error.
    pub fn failures(&self) -> flume::Receiver<WorkerFailure> {
        self.shared.failures_rx.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.shared.directory.names()
    }

    pub fn queue_count(&self) -> usize {
        self.shared.directory.count()
    }

    pub fn executor_count(&self) -> usize {
        self.shared.executors.len()
    }

    /// Approximate number of items waiting in queues.
    pub fn buffered_count(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    pub fn total_posted_last_minute(&self) -> u64 {
        self.shared.telemetry.last_minute(ClickKind::Posted)
    }

    pub fn total_processed_last_minute(&self) -> u64 {
        self.shared.telemetry.last_minute(ClickKind::Processed)
    }

    pub fn total_posted_last_hour(&self) -> u64 {
        self.shared.telemetry.last_hour(ClickKind::Posted)
    }

    pub fn total_processed_last_hour(&self) -> u64 {
        self.shared.telemetry.last_hour(ClickKind::Processed)
    }

    pub fn average_posted_per_min_last_hour(&self) -> f64 {
        self.shared
            .telemetry
            .average_per_minute_last_hour(ClickKind::Posted)
    }

    pub fn average_processed_per_min_last_hour(&self) -> f64 {
        self.shared
            .telemetry
            .average_per_minute_last_hour(ClickKind::Processed)
    }

    pub fn status(&self) -> WorkStatus {
        let config = self.shared.config();
        WorkStatus {
            state: self.state(),
            queues: self.queue_count(),
            executors: self.executor_count(),
            buffered: self.buffered_count(),
            max_workers: config.max_workers,
            max_buffered_items: config.max_buffered_items,
            posted_last_minute: self.total_posted_last_minute(),
            processed_last_minute: self.total_processed_last_minute(),
            posted_last_hour: self.total_posted_last_hour(),
            processed_last_hour: self.total_processed_last_hour(),
            average_posted_per_min_last_hour: self.average_posted_per_min_last_hour(),
            average_processed_per_min_last_hour: self.average_processed_per_min_last_hour(),
        }
    }
}

impl<T: WorkItem> Drop for WorkManager<T> {
    fn drop(&mut self) {
        if !self.state().is_active() {
            return;
        }
        // Dropped without stop: signal every background task to exit.
        self.shared.set_state(WorkState::Stopped);
        for worker in self.shared.executors.iter() {
            worker.request_stop();
        }
        self.shared.executors.clear();
        self.shared.deferred.cancel();
        let _ = self.trim_shutdown.send(true);
    }
}
