//! # Firewatch Service Worker
//!
//! Offline caching worker for a single application instance.
//!
//! ## Features
//!
//! - **Versioned store**: one named cache per deployment, whole-entry writes
//! - **Lifecycle**: install-time precache, activation-time generation GC,
//!   immediate takeover of open clients
//! - **Routing**: live-data hosts go network-first, everything else cache-first
//! - **Notifications**: push payloads become actionable alerts
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker::dispatch(WorkerEvent)
//!     │
//!     ├── Install / Activate ──► Lifecycle ──► CacheStorage ──► CacheBackend
//!     │                                                          ├── MemoryBackend
//!     │                                                          └── SqliteBackend
//!     ├── Fetch ──► Router ──► Strategies
//!     │                          ├── network_first (live data, 503 fallback)
//!     │                          └── cache_first (backfill via KeepAlive)
//!     ├── Push / NotificationClick ──► Notifier ──► NotificationSink
//!     └── Sync
//! ```

use firewatch_core::FirewatchError;
use firewatch_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod keepalive;
pub mod lifecycle;
pub mod notify;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey};
pub use clients::{Client, ClientType, Clients};
pub use keepalive::KeepAlive;
pub use lifecycle::{
    GenerationReport, Lifecycle, PopulateReport, ServiceWorker, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState,
};
pub use notify::{
    ClickOutcome, Notification, NotificationAction, NotificationId, NotificationSink, Notifier,
    PushPayload, RecordingSink, SyncOutcome,
};
pub use router::{HostPattern, RequestClass, Router};
pub use storage::{CacheBackend, MemoryBackend, SqliteBackend};
pub use strategy::Strategies;
pub use worker::{EventOutcome, OfflineWorker, ServiceWorkerEvent, WorkerEvent};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Push error: {0}")]
    Push(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] FirewatchError),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
