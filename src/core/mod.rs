pub mod deferred;
pub mod directory;
pub mod error;
pub mod handler;
pub mod item;
pub mod manager;
pub mod sliding_window;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod worker;
