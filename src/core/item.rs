//! Work items routed by the work manager.
//!
//! A work item carries an opaque payload plus the key it fans out on. The key
//! picks the per-key queue the item lands in; every item with the same key is
//! handled in posting order.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A unit of work posted to the router.
///
/// Items must be serializable so a durable store can persist them, and
/// cloneable so a store can keep an undo copy while a transaction is open.
pub trait WorkItem: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The fan-out key, usually a device or publisher identity.
    fn queue_name(&self) -> &str;
}
