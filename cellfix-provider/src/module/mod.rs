pub mod cells;
pub mod dataset;
pub mod engine;
pub mod online;
pub mod scheduled;
pub mod settings;
pub mod watcher;
