// Core modules
pub mod config;
pub mod context;
pub mod db;
pub mod exchange;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod market;
pub mod models;
pub mod node;
pub mod notify;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod strategy;

// Re-export commonly used types
pub use context::AppContext;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
