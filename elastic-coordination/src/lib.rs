pub mod client;
pub mod config;
pub mod error;
pub mod launcher;
pub mod lease;
pub mod manager;
pub mod publish;
pub mod readiness;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod util;
pub mod watcher;
