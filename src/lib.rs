pub mod config;
pub mod error;
pub mod health;
pub mod logger;
pub mod model;
pub mod platform;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod watcher;
pub mod worker;
