use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::core::error::RouterError;
use crate::core::handler::HandlerMode;
use crate::core::store::{JournalConfig, MemoryStoreConfig};

/// Upper bound for `max_workers` on this machine.
pub static WORKER_CEILING: Lazy<usize> = Lazy::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_mul(32)
});

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkManagerConfig {
    pub max_workers: usize,
    pub max_buffered_items: usize,
    /// Items a worker takes from one queue before handing the claim back.
    pub yield_queue_after: usize,
    /// How long a queue must stay empty before it is removed.
    pub remove_empty_queue_after_ms: u64,
    pub handler_mode: HandlerMode,
    pub no_queue_backoff_ms: u64,
    pub pause_poll_interval_ms: u64,
    pub drain_poll_interval_ms: u64,
    pub contended_dequeue_timeout_ms: u64,
    pub uncontended_dequeue_timeout_ms: u64,
    pub telemetry_trim_interval_ms: u64,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            max_buffered_items: 100_000,
            yield_queue_after: 32,
            remove_empty_queue_after_ms: 30_000,
            handler_mode: HandlerMode::Singleton,
            no_queue_backoff_ms: 50,
            pause_poll_interval_ms: 100,
            drain_poll_interval_ms: 50,
            contended_dequeue_timeout_ms: 10,
            uncontended_dequeue_timeout_ms: 500,
            telemetry_trim_interval_ms: 5_000,
        }
    }
}

impl WorkManagerConfig {
    /// Check the snapshot before it is published. `max_workers` is clamped
    /// to [`WORKER_CEILING`].
    pub fn validated(mut self) -> Result<Self, RouterError> {
        if self.max_workers == 0 {
            return Err(RouterError::InvalidConfig("max_workers must be at least 1".into()));
        }
        if self.max_buffered_items == 0 {
            return Err(RouterError::InvalidConfig(
                "max_buffered_items must be at least 1".into(),
            ));
        }
        if self.yield_queue_after == 0 {
            return Err(RouterError::InvalidConfig(
                "yield_queue_after must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("pause_poll_interval_ms", self.pause_poll_interval_ms),
            ("drain_poll_interval_ms", self.drain_poll_interval_ms),
            ("telemetry_trim_interval_ms", self.telemetry_trim_interval_ms),
        ] {
            if value == 0 {
                return Err(RouterError::InvalidConfig(format!("{name} must be positive")));
            }
        }

        let ceiling = *WORKER_CEILING;
        if self.max_workers > ceiling {
            tracing::warn!(
                requested = self.max_workers,
                ceiling,
                "max_workers clamped to platform ceiling"
            );
            self.max_workers = ceiling;
        }
        Ok(self)
    }

    pub fn remove_empty_queue_after(&self) -> Duration {
        Duration::from_millis(self.remove_empty_queue_after_ms)
    }

    pub fn no_queue_backoff(&self) -> Duration {
        Duration::from_millis(self.no_queue_backoff_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn contended_dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.contended_dequeue_timeout_ms)
    }

    pub fn uncontended_dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.uncontended_dequeue_timeout_ms)
    }

    pub fn telemetry_trim_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_trim_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct JournalSettings {
    /// Journal file. No path means a volatile in-memory store.
    pub path: Option<String>,
    pub fsync_every_n: Option<usize>,
    pub fsync_interval_ms: Option<u64>,
    pub channel_capacity: usize,
    pub compact_on_open: bool,
    pub lock_timeout_ms: u64,
}

impl Default for JournalSettings {
    fn default() -> Self {
        let journal = JournalConfig::default();
        let store = MemoryStoreConfig::default();
        Self {
            path: None,
            fsync_every_n: journal.fsync_every_n,
            fsync_interval_ms: journal.fsync_interval.map(|d| d.as_millis() as u64),
            channel_capacity: journal.channel_capacity,
            compact_on_open: store.compact_on_open,
            lock_timeout_ms: store.lock_timeout.as_millis() as u64,
        }
    }
}

impl JournalSettings {
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            fsync_every_n: self.fsync_every_n,
            fsync_interval: self.fsync_interval_ms.map(Duration::from_millis),
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            compact_on_open: self.compact_on_open,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub work_manager: WorkManagerConfig,
    pub journal: JournalSettings,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}
