//! keyrouter – the work-distribution core of a multi-tenant event router.
//!
//! This crate exports
//!  * `core`    – per-key durable queues, the claim pool, workers and the
//!    elastic work manager
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!  * `metrics` – Prometheus-style text exposition
//!
//! Items are posted to a [`WorkManager`], land in the queue named by their
//! key, and are handed one at a time, in order, to a [`Handler`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config, WorkManagerConfig};
pub use core::error::{RouterError, WorkerFailure};
pub use core::handler::{HandleOutcome, Handler, HandlerFactory, HandlerMode};
pub use core::item::WorkItem;
pub use core::manager::{WorkManager, WorkStatus};
pub use core::state::WorkState;
pub use core::store::{MemoryStore, Store, StoreError, Transaction};
