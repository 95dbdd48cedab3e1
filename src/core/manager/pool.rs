//! Elastic pool sizing. Every resize runs on the deferred runner, so grow and
//! shrink never race each other.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use super::Shared;
use crate::core::handler::Handler;
use crate::core::item::WorkItem;
use crate::core::state::WorkState;
use crate::core::worker::Worker;
use crate::metrics;

pub(crate) fn schedule_grow<T: WorkItem>(shared: &Arc<Shared<T>>) {
    let target = Arc::clone(shared);
    shared.deferred.add_work(move || async move {
        grow(&target);
        anyhow::Ok(())
    });
}

pub(crate) fn schedule_shrink<T: WorkItem>(shared: &Arc<Shared<T>>) {
    let target = Arc::clone(shared);
    shared.deferred.add_work(move || async move {
        shrink(&target).await;
        anyhow::Ok(())
    });
}

/// Release the per-queue handler a removed queue was using. A queue that has
/// been re-created under the same name keeps its own instance.
pub(crate) fn schedule_teardown<T: WorkItem>(
    shared: &Arc<Shared<T>>,
    queue: &str,
    handler: Arc<dyn Handler<T>>,
) {
    let target = Arc::clone(shared);
    let queue = queue.to_string();
    shared.deferred.add_work(move || async move {
        if target.handlers.evict_instance(&queue, &handler) {
            handler.release().await;
            debug!(target: "keyrouter::pool", queue = %queue, "handler released");
        }
        anyhow::Ok(())
    });
}

/// Called by a worker that found no claim to take: a pool with more workers
/// than queues gets a shrink check.
pub(crate) fn evaluate_idle<T: WorkItem>(shared: &Arc<Shared<T>>) {
    if shared.executors.len() > shrink_target(shared) {
        schedule_shrink(shared);
    }
}

fn shrink_target<T: WorkItem>(shared: &Shared<T>) -> usize {
    shared
        .directory
        .count()
        .min(shared.config().max_workers)
}

/// Add one worker if the pool is below both bounds.
pub(crate) fn grow<T: WorkItem>(shared: &Arc<Shared<T>>) -> bool {
    let state = shared.state();
    if !state.is_active() {
        return false;
    }

    prune_exited(shared);
    let max_workers = shared.config().max_workers;
    let current = shared.executors.len();
    let queues = shared.directory.count();
    if current >= max_workers || current + 1 > queues {
        return false;
    }

    let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    Worker::spawn(id, Arc::clone(shared), state == WorkState::Paused);

    // Pick up a pause or resume that raced with the spawn.
    if let Some(worker) = shared.executors.get(&id) {
        match shared.state() {
            WorkState::Paused => worker.pause(),
            WorkState::Working | WorkState::Draining => worker.resume(),
            WorkState::New | WorkState::Stopped => worker.request_stop(),
        }
    }

    metrics::inc_workers_started(1);
    info!(target: "keyrouter::pool", worker = id, executors = current + 1, queues, "worker added");
    true
}

/// Drop handles whose loop has already ended.
fn prune_exited<T: WorkItem>(shared: &Shared<T>) {
    shared.executors.retain(|id, worker| {
        let alive = !worker.has_exited();
        if !alive {
            debug!(target: "keyrouter::pool", worker = *id, "pruning exited worker");
        }
        alive
    });
}

/// Stop one worker if the pool is larger than it needs to be.
pub(crate) async fn shrink<T: WorkItem>(shared: &Arc<Shared<T>>) -> bool {
    prune_exited(shared);
    let target = shrink_target(shared);
    if shared.executors.len() <= target {
        return false;
    }

    let Some(id) = shared.executors.iter().next().map(|entry| *entry.key()) else {
        return false;
    };
    let Some((_, worker)) = shared.executors.remove(&id) else {
        return false;
    };

    worker.stop().await;
    metrics::inc_workers_stopped(1);
    info!(
        target: "keyrouter::pool",
        worker = worker.id(),
        executors = shared.executors.len(),
        target,
        "worker removed"
    );
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::WorkManagerConfig;
    use crate::core::handler::{HandleOutcome, HandlerFactory};
    use crate::core::manager::WorkManager;
    use crate::core::store::{MemoryStore, Store};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        key: String,
    }

    impl WorkItem for Ping {
        fn queue_name(&self) -> &str {
            &self.key
        }
    }

    #[derive(Default)]
    struct Counter {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Handler<Ping> for Counter {
        async fn handle(&self, _item: Ping) -> anyhow::Result<HandleOutcome<Ping>> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandleOutcome::Done)
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn exited_worker_does_not_hold_a_pool_slot() {
        let counter = Arc::new(Counter::default());
        let factory: HandlerFactory<Ping> = {
            let counter = Arc::clone(&counter);
            Arc::new(move || Arc::clone(&counter) as Arc<dyn Handler<Ping>>)
        };
        let store: Arc<dyn Store<Ping>> = Arc::new(MemoryStore::<Ping>::new());
        let config = WorkManagerConfig {
            max_workers: 1,
            no_queue_backoff_ms: 5,
            pause_poll_interval_ms: 5,
            ..Default::default()
        };
        let manager = WorkManager::new(store, factory, config).unwrap();
        manager.start().await.unwrap();
        let shared = Arc::clone(&manager.shared);

        // A handle whose loop has already ended fills the only slot.
        Worker::spawn(99, Arc::clone(&shared), true);
        if let Some(worker) = shared.executors.get(&99) {
            worker.request_stop();
        }
        assert!(
            wait_until(|| shared
                .executors
                .get(&99)
                .is_some_and(|worker| worker.has_exited()))
            .await
        );
        assert_eq!(shared.executors.len(), 1);

        manager
            .post(Ping {
                key: "k".to_string(),
            })
            .await
            .unwrap();
        assert!(wait_until(|| counter.handled.load(Ordering::SeqCst) == 1).await);
        assert!(shared.executors.get(&99).is_none());
        manager.stop().await.unwrap();
    }
}
