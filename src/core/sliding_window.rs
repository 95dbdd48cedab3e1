//! Lock-free sliding-window event counter.
//!
//! Clicks are prepended to a singly-linked list, newest first. The head
//! pointer plays the role of the sentinel: it carries no timestamp and is
//! never counted. Producers only ever swap the head, so `click` never blocks
//! and readers walk an immutable snapshot of the chain.
//!
//! A periodic trim cuts the chain at the first node older than the retention
//! window and hands the clicks recorded since the previous trim to an
//! optional roll-up callback, so a coarser counter can aggregate them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

/// Reads that give up waiting for a quiet roll-up after this many tries.
const CONSISTENT_READ_TRIES: usize = 64;

type Rollup<K> = Box<dyn Fn(&[Click<K>]) + Send + Sync>;

/// A detached copy of one recorded click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Click<K> {
    pub at: Instant,
    pub kind: K,
    pub value: u64,
}

struct Node<K> {
    at: Instant,
    kind: K,
    value: u64,
    next: ArcSwapOption<Node<K>>,
}

impl<K: Copy> Node<K> {
    fn click(&self) -> Click<K> {
        Click {
            at: self.at,
            kind: self.kind,
            value: self.value,
        }
    }
}

impl<K> Drop for Node<K> {
    // Unlink iteratively; a long chain would otherwise recurse once per node.
    fn drop(&mut self) {
        let mut next = self.next.swap(None);
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(node) => next = node.next.swap(None),
                Err(_) => break,
            }
        }
    }
}

pub struct SlidingWindowCounter<K> {
    head: ArcSwapOption<Node<K>>,
    retention: Duration,
    /// Newest node seen by the last roll-up.
    rolled: ArcSwapOption<Node<K>>,
    rollup: Option<Rollup<K>>,
    /// Odd while a roll-up is being handed over.
    rollup_seq: AtomicU64,
    trimming: parking_lot::Mutex<()>,
}

impl<K> SlidingWindowCounter<K>
where
    K: Copy + Eq + Send + Sync + 'static,
{
    pub fn new(retention: Duration) -> Self {
        Self {
            head: ArcSwapOption::empty(),
            retention,
            rolled: ArcSwapOption::empty(),
            rollup: None,
            rollup_seq: AtomicU64::new(0),
            trimming: parking_lot::Mutex::new(()),
        }
    }

    /// Register the callback that receives each trim's fresh clicks.
    pub fn with_rollup<F>(mut self, rollup: F) -> Self
    where
        F: Fn(&[Click<K>]) + Send + Sync + 'static,
    {
        self.rollup = Some(Box::new(rollup));
        self
    }

    /// Record `value` events of `kind` at the current instant.
    pub fn click(&self, kind: K, value: u64) {
        let node = Arc::new(Node {
            at: Instant::now(),
            kind,
            value,
            next: ArcSwapOption::empty(),
        });

        self.head.rcu(|current| {
            node.next.store(current.clone());
            Some(Arc::clone(&node))
        });
    }

    /// Number of clicks recorded within `window`.
    pub fn count(&self, window: Duration) -> usize {
        let mut total = 0;
        self.walk(window, |_| total += 1);
        total
    }

    /// Sum of the values of `kind` recorded within `window`.
    pub fn sum(&self, window: Duration, kind: K) -> u64 {
        let mut total = 0u64;
        self.walk(window, |node| {
            if node.kind == kind {
                total = total.saturating_add(node.value);
            }
        });
        total
    }

    /// Copies of every click within `window`, newest first.
    pub fn snapshot(&self, window: Duration) -> Vec<Click<K>> {
        let mut clicks = Vec::new();
        self.walk(window, |node| clicks.push(node.click()));
        clicks
    }

    /// Apply `f` to a copy of every click within `window`, newest first.
    ///
    /// The prefix is copied before `f` runs, so `f` may click on this
    /// counter without affecting the walk.
    pub fn for_each<F>(&self, window: Duration, mut f: F)
    where
        F: FnMut(&Click<K>),
    {
        for click in self.snapshot(window) {
            f(&click);
        }
    }

    /// Sum of `kind` over clicks not yet handed to the roll-up.
    pub fn sum_unrolled(&self, kind: K) -> u64 {
        let marker = self.rolled.load_full();
        let mut total = 0u64;
        self.walk_until(self.head.load_full(), marker.as_ref(), |node| {
            if node.kind == kind {
                total = total.saturating_add(node.value);
            }
        });
        total
    }

    /// `sum_unrolled(kind) + rolled()`, read so that no roll-up lands in
    /// between: each click is counted on exactly one side.
    ///
    /// `rolled` should read whatever the roll-up callback feeds.
    pub fn sum_unrolled_with<F>(&self, kind: K, rolled: F) -> u64
    where
        F: Fn() -> u64,
    {
        let mut total = 0;
        for _ in 0..CONSISTENT_READ_TRIES {
            let before = self.rollup_seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::thread::yield_now();
                continue;
            }
            total = self.sum_unrolled(kind).saturating_add(rolled());
            if self.rollup_seq.load(Ordering::Acquire) == before {
                return total;
            }
        }
        total
    }

    /// Roll up fresh clicks, then drop everything past the retention window.
    pub fn trim(&self) {
        let _trimming = self.trimming.lock();
        if let Some(rollup) = &self.rollup {
            let newest = self.head.load_full();
            let marker = self.rolled.load_full();
            let mut fresh = Vec::new();
            self.walk_until(newest.clone(), marker.as_ref(), |node| {
                fresh.push(node.click())
            });
            if !fresh.is_empty() {
                self.rollup_seq.fetch_add(1, Ordering::AcqRel);
                rollup(&fresh);
                self.rolled.store(newest);
                self.rollup_seq.fetch_add(1, Ordering::AcqRel);
            }
        }

        let now = Instant::now();
        let retention = self.retention;
        let expired = |node: &Node<K>| now.saturating_duration_since(node.at) > retention;

        self.head.rcu(|current| match current {
            Some(node) if expired(&**node) => None,
            other => other.clone(),
        });

        let Some(mut prev) = self.head.load_full() else {
            self.rolled.store(None);
            return;
        };

        let mut kept = 1usize;
        loop {
            let Some(next) = prev.next.load_full() else {
                break;
            };
            if expired(&*next) {
                prev.next.store(None);
                break;
            }
            kept += 1;
            prev = next;
        }
        trace!(target: "keyrouter::telemetry", kept, "sliding window trimmed");
    }

    /// Run [`trim`](Self::trim) every `interval` until `shutdown` flips.
    pub fn spawn_trimmer(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => counter.trim(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn walk<F>(&self, window: Duration, mut f: F)
    where
        F: FnMut(&Node<K>),
    {
        let now = Instant::now();
        let mut cursor = self.head.load_full();
        while let Some(node) = cursor {
            if now.saturating_duration_since(node.at) > window {
                break;
            }
            f(&node);
            cursor = node.next.load_full();
        }
    }

    fn walk_until<F>(&self, start: Option<Arc<Node<K>>>, marker: Option<&Arc<Node<K>>>, mut f: F)
    where
        F: FnMut(&Node<K>),
    {
        let now = Instant::now();
        let mut cursor = start;
        while let Some(node) = cursor {
            if marker.is_some_and(|marker| Arc::ptr_eq(marker, &node)) {
                break;
            }
            if now.saturating_duration_since(node.at) > self.retention {
                break;
            }
            f(&node);
            cursor = node.next.load_full();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        In,
        Out,
    }

    #[test]
    fn empty_counter_reports_zero() {
        let counter: SlidingWindowCounter<Kind> = SlidingWindowCounter::new(Duration::from_secs(60));
        assert_eq!(counter.count(Duration::from_secs(60)), 0);
        assert_eq!(counter.sum(Duration::from_secs(60), Kind::In), 0);
        counter.trim();
    }

    #[test]
    fn sum_filters_by_kind() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(60));
        counter.click(Kind::In, 3);
        counter.click(Kind::Out, 1);
        counter.click(Kind::In, 4);

        let window = Duration::from_secs(60);
        assert_eq!(counter.count(window), 3);
        assert_eq!(counter.sum(window, Kind::In), 7);
        assert_eq!(counter.sum(window, Kind::Out), 1);

        let values: Vec<u64> = counter.snapshot(window).iter().map(|c| c.value).collect();
        assert_eq!(values, vec![4, 1, 3]);
    }

    #[test]
    fn window_excludes_older_clicks() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(60));
        counter.click(Kind::In, 1);
        std::thread::sleep(Duration::from_millis(40));
        counter.click(Kind::In, 1);

        assert_eq!(counter.count(Duration::from_millis(20)), 1);
        assert_eq!(counter.count(Duration::from_secs(60)), 2);
    }

    #[test]
    fn for_each_may_click_while_walking() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(60));
        counter.click(Kind::In, 1);
        counter.click(Kind::In, 2);

        let mut visited = 0;
        counter.for_each(Duration::from_secs(60), |click| {
            visited += 1;
            counter.click(Kind::Out, click.value);
        });

        assert_eq!(visited, 2);
        assert_eq!(counter.sum(Duration::from_secs(60), Kind::Out), 3);
    }

    #[test]
    fn trim_drops_expired_clicks() {
        let counter = SlidingWindowCounter::new(Duration::from_millis(30));
        counter.click(Kind::In, 1);
        counter.click(Kind::In, 1);
        std::thread::sleep(Duration::from_millis(50));
        counter.click(Kind::In, 5);

        counter.trim();
        let all = counter.snapshot(Duration::from_secs(3600));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, 5);

        std::thread::sleep(Duration::from_millis(50));
        counter.trim();
        assert_eq!(counter.count(Duration::from_secs(3600)), 0);
    }

    #[test]
    fn rollup_sees_each_click_once() {
        let rolled = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&rolled);
        let counter = SlidingWindowCounter::new(Duration::from_secs(60)).with_rollup(
            move |clicks: &[Click<Kind>]| {
                let total: u64 = clicks.iter().map(|c| c.value).sum();
                sink.fetch_add(total, Ordering::SeqCst);
            },
        );

        counter.click(Kind::In, 2);
        counter.click(Kind::In, 3);
        assert_eq!(counter.sum_unrolled(Kind::In), 5);

        counter.trim();
        assert_eq!(rolled.load(Ordering::SeqCst), 5);
        assert_eq!(counter.sum_unrolled(Kind::In), 0);

        counter.trim();
        assert_eq!(rolled.load(Ordering::SeqCst), 5);

        counter.click(Kind::In, 10);
        counter.trim();
        assert_eq!(rolled.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn concurrent_clicks_are_all_counted() {
        let counter = Arc::new(SlidingWindowCounter::new(Duration::from_secs(60)));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        counter.click(Kind::In, 1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.count(Duration::from_secs(60)), 4000);
    }

    #[tokio::test]
    async fn trimmer_stops_on_shutdown() {
        let counter = Arc::new(SlidingWindowCounter::new(Duration::from_millis(10)));
        counter.click(Kind::In, 1);

        let (tx, rx) = watch::channel(false);
        let handle = counter.spawn_trimmer(Duration::from_millis(5), rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.count(Duration::from_secs(3600)), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
