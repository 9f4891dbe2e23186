pub mod discovery;
pub mod events;
pub mod models;
pub mod watcher;
