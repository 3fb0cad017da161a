pub mod action;
pub mod cancel;
pub mod config;
pub mod declaration;
pub mod error;
pub mod host;
pub mod recipe;
pub mod remote;
pub mod scheduler;
pub mod secrets;
pub mod ssh;
pub mod task;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
