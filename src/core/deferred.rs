//! Single-consumer runner for low-priority background bookkeeping.
//!
//! Pool resize checks and handler teardown are queued here instead of being
//! run inline on the hot path. One loop executes one task at a time; a task
//! error goes to the error callback and the loop keeps going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type DeferredTask = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

type ErrorCallback = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerSignal {
    Run,
    Drain,
    Stop,
}

pub struct DeferredTaskRunner {
    tx: flume::Sender<DeferredTask>,
    rx: flume::Receiver<DeferredTask>,
    accepting: AtomicBool,
    signal: watch::Sender<RunnerSignal>,
    on_error: ErrorCallback,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredTaskRunner {
    pub fn new() -> Self {
        Self::with_error_callback(|err| {
            warn!(target: "keyrouter::deferred", error = %format!("{err:#}"), "deferred task failed");
        })
    }

    pub fn with_error_callback<F>(on_error: F) -> Self
    where
        F: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        let (tx, rx) = flume::unbounded();
        let (signal, _) = watch::channel(RunnerSignal::Run);
        Self {
            tx,
            rx,
            accepting: AtomicBool::new(true),
            signal,
            on_error: Arc::new(on_error),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the consumer loop. Calling this twice has no effect.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let rx = self.rx.clone();
        let mut signal = self.signal.subscribe();
        let on_error = Arc::clone(&self.on_error);

        *handle = Some(tokio::spawn(async move {
            loop {
                let state = *signal.borrow_and_update();
                match state {
                    RunnerSignal::Stop => break,
                    RunnerSignal::Drain => {
                        while let Ok(task) = rx.try_recv() {
                            run_task(task, &on_error).await;
                        }
                        break;
                    }
                    RunnerSignal::Run => {}
                }

                tokio::select! {
                    biased;
                    changed = signal.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    task = rx.recv_async() => match task {
                        Ok(task) => run_task(task, &on_error).await,
                        Err(_) => break,
                    },
                }
            }
            debug!(target: "keyrouter::deferred", "deferred runner exited");
        }));
    }

    /// Queue a task. Returns `false` once the runner is draining or stopped.
    pub fn add_work<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        let task: DeferredTask = Box::new(move || Box::pin(task()));
        self.tx.send(task).is_ok()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Stop the loop now; queued tasks are dropped.
    pub async fn stop(&self) {
        self.shutdown(RunnerSignal::Stop).await;
        while self.rx.try_recv().is_ok() {}
    }

    /// Stop accepting, run everything already queued, then exit.
    pub async fn drain_stop(&self) {
        self.shutdown(RunnerSignal::Drain).await;
    }

    /// Signal the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.signal_exit(RunnerSignal::Stop);
    }

    fn signal_exit(&self, signal: RunnerSignal) {
        self.accepting.store(false, Ordering::Release);
        self.signal.send_if_modified(|current| {
            if *current == RunnerSignal::Run {
                *current = signal;
                true
            } else {
                false
            }
        });
    }

    async fn shutdown(&self, signal: RunnerSignal) {
        self.signal_exit(signal);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(target: "keyrouter::deferred", error = %err, "deferred runner panicked");
            }
        }
    }
}

impl Default for DeferredTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_task(task: DeferredTask, on_error: &ErrorCallback) {
    if let Err(err) = task().await {
        on_error(err);
    }
}
