//! # Firewatch Core
//!
//! Shared configuration, error types, and logging setup for the Firewatch
//! offline worker.
//!
//! The worker reads everything it needs from one immutable [`WorkerConfig`]
//! built at startup: the versioned store name, the install-time asset
//! manifest, the live-data host allow-list, and the notification defaults.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{NotificationConfig, WorkerConfig};
pub use error::{FirewatchError, FirewatchResult};
pub use logging::{init_logging, LogConfig, LogFormat};
