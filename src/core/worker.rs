//! Worker loop: claim a queue, drain a slice of it, decide its fate.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::core::error::{RouterError, WorkerFailure};
use crate::core::handler::{HandleOutcome, HandlerMode};
use crate::core::item::WorkItem;
use crate::core::manager::{pool, Shared};
use crate::core::store::DurableQueue;
use crate::core::telemetry::ClickKind;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Run,
    Pause,
    Stop,
}

/// Handle to one running worker loop.
#[derive(Debug)]
pub struct Worker {
    id: u64,
    signal: watch::Sender<WorkerSignal>,
    exited: watch::Receiver<bool>,
}

impl Worker {
    /// Register a worker in `shared.executors` and start its loop.
    ///
    /// The handle is inserted before the task exists, so a loop that fails
    /// on its first item always finds its own entry to remove.
    pub(crate) fn spawn<T: WorkItem>(id: u64, shared: Arc<Shared<T>>, paused: bool) {
        let initial = if paused {
            WorkerSignal::Pause
        } else {
            WorkerSignal::Run
        };
        let (signal, signal_rx) = watch::channel(initial);
        let (exited_tx, exited) = watch::channel(false);
        shared.executors.insert(
            id,
            Self {
                id,
                signal,
                exited,
            },
        );

        tokio::spawn(async move {
            debug!(target: "keyrouter::worker", worker = id, paused, "worker started");
            match run(&shared, signal_rx).await {
                Ok(()) => debug!(target: "keyrouter::worker", worker = id, "worker exited"),
                Err((queue, err)) => {
                    shared.executors.remove(&id);
                    metrics::inc_workers_failed(1);
                    error!(
                        target: "keyrouter::worker",
                        worker = id,
                        queue = queue.as_deref().unwrap_or("-"),
                        error = %err,
                        "worker terminated"
                    );
                    shared.report_failure(WorkerFailure {
                        worker: id,
                        queue,
                        error: err.to_string(),
                    });
                    pool::schedule_grow(&shared);
                }
            }
            let _ = exited_tx.send(true);
        });
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pause(&self) {
        self.signal.send_if_modified(|current| {
            let changed = *current == WorkerSignal::Run;
            if changed {
                *current = WorkerSignal::Pause;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.signal.send_if_modified(|current| {
            let changed = *current == WorkerSignal::Pause;
            if changed {
                *current = WorkerSignal::Run;
            }
            changed
        });
    }

    pub fn request_stop(&self) {
        self.signal.send_replace(WorkerSignal::Stop);
    }

    /// Signal the loop to stop and wait until it has exited.
    pub async fn stop(&self) {
        self.request_stop();
        let mut exited = self.exited.clone();
        // An error means the task is gone, which is just as good.
        let _ = exited.wait_for(|done| *done).await;
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slice {
    handled: usize,
    /// Ended on the fairness bound rather than on an empty queue.
    exhausted: bool,
}

type Fatal = (Option<String>, RouterError);

async fn run<T: WorkItem>(
    shared: &Arc<Shared<T>>,
    mut signal: watch::Receiver<WorkerSignal>,
) -> Result<(), Fatal> {
    loop {
        if !wait_while_paused(shared, &mut signal).await {
            return Ok(());
        }

        let Some((name, queue)) = shared.directory.take_claim() else {
            pool::evaluate_idle(shared);
            let backoff = shared.config().no_queue_backoff();
            if !sleep_unless_stopped(&mut signal, backoff).await {
                return Ok(());
            }
            continue;
        };

        let slice = match drain_slice(shared, &name, &queue).await {
            Ok(slice) => slice,
            Err(err) => {
                shared.directory.return_claim(&name);
                return Err((Some(name), err));
            }
        };

        if let Err(err) = finalize(shared, &name, slice).await {
            return Err((Some(name), err));
        }

        if slice.handled == 0 {
            // Nothing to do on this queue; don't spin through the pool.
            let backoff = shared.config().no_queue_backoff();
            if !sleep_unless_stopped(&mut signal, backoff).await {
                return Ok(());
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
}

/// Returns `false` once the worker should exit.
async fn wait_while_paused<T: WorkItem>(
    shared: &Shared<T>,
    signal: &mut watch::Receiver<WorkerSignal>,
) -> bool {
    loop {
        let current = *signal.borrow_and_update();
        match current {
            WorkerSignal::Run => return true,
            WorkerSignal::Stop => return false,
            WorkerSignal::Pause => {}
        }

        let poll = shared.config().pause_poll_interval();
        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Returns `false` if a stop arrived during the sleep.
async fn sleep_unless_stopped(signal: &mut watch::Receiver<WorkerSignal>, period: Duration) -> bool {
    tokio::select! {
        changed = signal.changed() => {
            changed.is_ok() && *signal.borrow() != WorkerSignal::Stop
        }
        _ = tokio::time::sleep(period) => true,
    }
}

async fn drain_slice<T: WorkItem>(
    shared: &Shared<T>,
    name: &str,
    queue: &DurableQueue,
) -> Result<Slice, RouterError> {
    let config = shared.config();
    let contended = shared.directory.count() > shared.executors.len();
    let timeout = if contended {
        config.contended_dequeue_timeout()
    } else {
        config.uncontended_dequeue_timeout()
    };

    let mut slice = Slice::default();
    while slice.handled < config.yield_queue_after {
        let mut tx = shared.directory.begin().await?;
        let item = match queue.try_dequeue(tx.as_mut(), timeout).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(err) if err.is_timeout() => {
                trace!(target: "keyrouter::worker", queue = %name, "dequeue timed out");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let handler = shared.handlers.resolve(config.handler_mode, name);
        // On error the transaction is dropped and the item stays at the head.
        let outcome = handler.handle(item).await.map_err(RouterError::Handler)?;
        if config.handler_mode == HandlerMode::PerItem {
            handler.release().await;
        }

        match outcome {
            HandleOutcome::Retry(item) => {
                queue.enqueue(tx.as_mut(), item).await?;
                tx.commit().await?;
                shared.telemetry.record(ClickKind::Retried, 1);
                metrics::inc_items_retried(1);
            }
            HandleOutcome::Done => {
                tx.commit().await?;
                let _ = shared
                    .buffered
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_sub(1))
                    });
                shared.telemetry.record(ClickKind::Processed, 1);
            }
        }
        slice.handled += 1;
    }

    slice.exhausted = slice.handled >= config.yield_queue_after;
    Ok(slice)
}

/// Decide whether the claimed queue goes back to the pool or away.
async fn finalize<T: WorkItem>(
    shared: &Arc<Shared<T>>,
    name: &str,
    slice: Slice,
) -> Result<(), RouterError> {
    let directory = &shared.directory;
    if slice.exhausted {
        directory.clear_suspicion(name);
        directory.return_claim(name);
        return Ok(());
    }

    let depth = match queue_depth(shared, name).await {
        Ok(depth) => depth,
        Err(err) if is_benign(&err) => {
            directory.return_claim(name);
            return Ok(());
        }
        Err(err) => {
            directory.return_claim(name);
            return Err(err);
        }
    };

    if depth > 0 {
        directory.clear_suspicion(name);
        directory.return_claim(name);
        return Ok(());
    }

    let now = Instant::now();
    let Some(since) = directory.suspected_since(name) else {
        directory.suspect(name, now);
        directory.return_claim(name);
        return Ok(());
    };

    if now.saturating_duration_since(since) < shared.config().remove_empty_queue_after() {
        directory.return_claim(name);
        return Ok(());
    }

    // Only the claim holder resolves a per-queue handler, so this is the
    // instance the removed queue used.
    let cached = shared.handlers.cached(name);
    match directory.remove(name).await {
        Ok(true) => {
            debug!(target: "keyrouter::worker", queue = %name, "idle queue removed");
            if let Some(handler) = cached {
                pool::schedule_teardown(shared, name, handler);
            }
            pool::schedule_shrink(shared);
            Ok(())
        }
        Ok(false) => {
            directory.clear_suspicion(name);
            directory.return_claim(name);
            Ok(())
        }
        Err(err) if err.is_timeout() => {
            directory.return_claim(name);
            Ok(())
        }
        Err(err) => {
            directory.return_claim(name);
            Err(err.into())
        }
    }
}

async fn queue_depth<T: WorkItem>(shared: &Shared<T>, name: &str) -> Result<usize, RouterError> {
    let mut tx = shared.directory.begin().await?;
    let depth = tx.count(name).await?;
    tx.commit().await?;
    Ok(depth)
}

fn is_benign(err: &RouterError) -> bool {
    matches!(err, RouterError::Store(store) if store.is_timeout())
}
