use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::manager::WorkStatus;

// Global counters (low overhead). These are coarse-grained and process-wide.
static QUEUES_CREATED: AtomicU64 = AtomicU64::new(0);
static QUEUES_REMOVED: AtomicU64 = AtomicU64::new(0);
static WORKERS_STARTED: AtomicU64 = AtomicU64::new(0);
static WORKERS_STOPPED: AtomicU64 = AtomicU64::new(0);
static WORKERS_FAILED: AtomicU64 = AtomicU64::new(0);
static ITEMS_RETRIED: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn inc_queues_created(n: u64) {
    QUEUES_CREATED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_queues_removed(n: u64) {
    QUEUES_REMOVED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_workers_started(n: u64) {
    WORKERS_STARTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_workers_stopped(n: u64) {
    WORKERS_STOPPED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_workers_failed(n: u64) {
    WORKERS_FAILED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_items_retried(n: u64) {
    ITEMS_RETRIED.fetch_add(n, Ordering::Relaxed);
}

/// Process-wide counters only.
pub fn snapshot() -> String {
    // Simple text format (Prometheus-style without HELP/TYPE lines for brevity)
    format!(
        "keyrouter_queues_created_total {}\nkeyrouter_queues_removed_total {}\nkeyrouter_workers_started_total {}\nkeyrouter_workers_stopped_total {}\nkeyrouter_workers_failed_total {}\nkeyrouter_items_retried_total {}\n",
        QUEUES_CREATED.load(Ordering::Relaxed),
        QUEUES_REMOVED.load(Ordering::Relaxed),
        WORKERS_STARTED.load(Ordering::Relaxed),
        WORKERS_STOPPED.load(Ordering::Relaxed),
        WORKERS_FAILED.load(Ordering::Relaxed),
        ITEMS_RETRIED.load(Ordering::Relaxed),
    )
}

/// One manager's status followed by the process-wide counters.
pub fn render(status: &WorkStatus) -> String {
    let mut out = String::with_capacity(768);
    let _ = writeln!(out, "keyrouter_state{{state=\"{}\"}} 1", status.state);
    let gauges: [(&str, f64); 12] = [
        ("keyrouter_queues", status.queues as f64),
        ("keyrouter_executors", status.executors as f64),
        ("keyrouter_buffered_items", status.buffered as f64),
        ("keyrouter_max_workers", status.max_workers as f64),
        ("keyrouter_max_buffered_items", status.max_buffered_items as f64),
        ("keyrouter_posted_last_minute", status.posted_last_minute as f64),
        ("keyrouter_processed_last_minute", status.processed_last_minute as f64),
        ("keyrouter_posted_last_hour", status.posted_last_hour as f64),
        ("keyrouter_processed_last_hour", status.processed_last_hour as f64),
        (
            "keyrouter_posted_per_minute_last_hour",
            status.average_posted_per_min_last_hour,
        ),
        (
            "keyrouter_processed_per_minute_last_hour",
            status.average_processed_per_min_last_hour,
        ),
        ("keyrouter_up", if status.state.is_active() { 1.0 } else { 0.0 }),
    ];
    for (name, value) in gauges {
        let _ = writeln!(out, "{name} {value}");
    }
    out.push_str(&snapshot());
    out
}
