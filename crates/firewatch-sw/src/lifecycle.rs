//! Worker lifecycle: registration state, install-time population and
//! activation-time collection of old store generations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use firewatch_core::WorkerConfig;
use firewatch_net::{Fetcher, Request, RequestMode};
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Populating the current store.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Collecting old generations.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker applies fetch strategies.
    pub fn can_intercept_fetch(&self) -> bool {
        *self == Self::Activated
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Store this worker populates and serves from.
    pub cache_name: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// The installing, waiting and active workers for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Workers replaced or failed, most recent last.
    pub retired: Vec<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            retired: Vec::new(),
        }
    }

    /// Start installing a new worker for `cache_name`.
    pub fn begin_install(&mut self, cache_name: impl Into<String>) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        if let Some(mut previous) = self.installing.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
            self.retired.push(previous);
        }
        id
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            if let Some(mut previous) = self.waiting.replace(worker) {
                previous.set_state(ServiceWorkerState::Redundant);
                self.retired.push(previous);
            }
        }
    }

    /// Mark the installing worker redundant after a failed install.
    pub fn install_failed(&mut self, reason: impl Into<String>) {
        if let Some(mut worker) = self.installing.take() {
            worker.error = Some(reason.into());
            worker.set_state(ServiceWorkerState::Redundant);
            self.retired.push(worker);
        }
    }

    /// Promote the waiting worker, retiring the current active one.
    ///
    /// The promoted worker is left in `Activating`; call
    /// [`ServiceWorkerRegistration::activate`] once activation work is done.
    pub fn skip_waiting(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
            self.retired.push(old);
        }

        let id = worker.id;
        self.active = Some(worker);
        Some(id)
    }

    /// Finish activation of the active worker.
    pub fn activate(&mut self) -> Option<ServiceWorkerId> {
        let worker = self.active.as_mut()?;
        worker.set_state(ServiceWorkerState::Activated);
        Some(worker.id)
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Find a worker in any slot, including retired ones.
    pub fn get(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .chain(self.retired.iter())
            .find(|w| w.id == id)
    }
}

// ==================== Lifecycle ====================

/// Result of populating the current store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulateReport {
    pub cache_name: String,
    pub entries: usize,
}

/// Result of collecting old store generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub current: String,
    pub deleted: Vec<String>,
    /// Stores that could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Install and activation work against the store.
#[derive(Clone)]
pub struct Lifecycle {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
}

impl Lifecycle {
    pub fn new(config: Arc<WorkerConfig>, fetcher: Arc<dyn Fetcher>, caches: CacheStorage) -> Self {
        Self {
            config,
            fetcher,
            caches,
        }
    }

    /// Fetch every manifest asset and store them in the current store.
    ///
    /// All or nothing: if any asset fails, nothing is written and the store
    /// is not created. Assets are fetched in same-origin mode.
    pub async fn populate(&self) -> Result<PopulateReport> {
        let cache_name = self.config.cache_name();
        let urls = self.config.precache_urls()?;
        info!(cache = %cache_name, assets = urls.len(), "Populating store");

        let fetches = urls.into_iter().map(|url| {
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let request = Request::get(url.clone()).mode(RequestMode::SameOrigin);
                match fetcher.fetch(request.clone()).await {
                    Ok(response) if response.ok() => Ok((request, response)),
                    Ok(response) => Err(ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: format!("status {}", response.status),
                    }),
                    Err(e) => Err(ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        });

        let pairs = try_join_all(fetches).await?;
        let entries = pairs.len();

        let cache = self.caches.open(&cache_name).await?;
        cache.put_all(pairs).await?;

        info!(cache = %cache_name, entries, "Store populated");
        Ok(PopulateReport {
            cache_name,
            entries,
        })
    }

    /// Delete every store except the current one.
    ///
    /// Deletions run concurrently and a failed deletion never stops the
    /// others.
    pub async fn collect_generations(&self) -> GenerationReport {
        let current = self.config.cache_name();
        let mut report = GenerationReport {
            current: current.clone(),
            ..Default::default()
        };

        let names = match self.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list stores, skipping collection");
                return report;
            }
        };

        let deletions = names.into_iter().filter(|name| *name != current).map(|name| {
            let caches = self.caches.clone();
            async move {
                let result = caches.delete(&name).await;
                (name, result)
            }
        });

        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => {
                    debug!(cache = %name, "Deleted old store");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old store");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            current = %report.current,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Collected old stores"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_url, FailingBackend, MockFetcher};
    use http::StatusCode;

    fn lifecycle(fetcher: Arc<MockFetcher>, caches: CacheStorage) -> Lifecycle {
        Lifecycle::new(Arc::new(WorkerConfig::default()), fetcher, caches)
    }

    #[test]
    fn test_service_worker_creation() {
        let worker = ServiceWorker::new("incident-dashboard-v1.0");
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
        assert!(!worker.state.can_intercept_fetch());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut reg = ServiceWorkerRegistration::new(app_url("/"));

        let first = reg.begin_install("v1");
        reg.install_complete();
        assert_eq!(reg.skip_waiting(), Some(first));
        assert_eq!(reg.activate(), Some(first));
        assert!(reg.get_active().unwrap().is_active());

        let second = reg.begin_install("v2");
        reg.install_complete();
        assert!(reg.waiting.is_some());
        reg.skip_waiting();
        reg.activate();

        assert_eq!(reg.get_active().unwrap().id, second);
        assert!(reg.retired.iter().any(|w| w.id == first && w.is_redundant()));
        assert_eq!(reg.get(first).unwrap().state, ServiceWorkerState::Redundant);
        assert_eq!(reg.get(second).unwrap().state, ServiceWorkerState::Activated);
        assert!(reg.get(ServiceWorkerId::new()).is_none());
    }

    #[test]
    fn test_install_failed_is_redundant() {
        let mut reg = ServiceWorkerRegistration::new(app_url("/"));
        let id = reg.begin_install("v1");
        reg.install_failed("offline");

        assert!(reg.installing.is_none());
        assert!(reg.skip_waiting().is_none());
        let retired = reg.retired.last().unwrap();
        assert_eq!(retired.id, id);
        assert!(retired.is_redundant());
        assert_eq!(retired.error.as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_populate_stores_manifest() {
        let fetcher = MockFetcher::new();
        let config = WorkerConfig::default();
        fetcher.serve_manifest(&config);
        let caches = CacheStorage::in_memory();

        let report = lifecycle(fetcher.clone(), caches.clone()).populate().await.unwrap();

        assert_eq!(report.cache_name, "incident-dashboard-v1.0");
        assert_eq!(report.entries, config.precache.len());
        let cache = caches.open("incident-dashboard-v1.0").await.unwrap();
        for url in config.precache_urls().unwrap() {
            assert!(cache.match_url(&url).await.unwrap().is_some(), "{url} missing");
        }
    }

    #[tokio::test]
    async fn test_populate_is_idempotent() {
        let fetcher = MockFetcher::new();
        fetcher.serve_manifest(&WorkerConfig::default());
        let caches = CacheStorage::in_memory();
        let lifecycle = lifecycle(fetcher, caches.clone());

        lifecycle.populate().await.unwrap();
        let cache = caches.open("incident-dashboard-v1.0").await.unwrap();
        let mut first = cache.keys().await.unwrap();
        lifecycle.populate().await.unwrap();
        let mut second = cache.keys().await.unwrap();

        first.sort();
        second.sort();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_populate_all_or_nothing() {
        let fetcher = MockFetcher::new();
        fetcher.serve_manifest(&WorkerConfig::default());
        fetcher.respond(&app_url("/icon-512.png"), StatusCode::NOT_FOUND, "");
        let caches = CacheStorage::in_memory();

        let result = lifecycle(fetcher, caches.clone()).populate().await;

        match result {
            Err(ServiceWorkerError::InstallFailed { url, reason }) => {
                assert!(url.ends_with("/icon-512.png"));
                assert!(reason.contains("404"));
            }
            other => panic!("expected install failure, got {other:?}"),
        }
        assert!(!caches.has("incident-dashboard-v1.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_collect_generations() {
        let caches = CacheStorage::in_memory();
        for name in ["incident-dashboard-v0.8", "incident-dashboard-v0.9", "incident-dashboard-v1.0"] {
            caches.open(name).await.unwrap();
        }

        let report = lifecycle(MockFetcher::new(), caches.clone())
            .collect_generations()
            .await;

        assert_eq!(caches.keys().await.unwrap(), vec!["incident-dashboard-v1.0"]);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_collect_generations_isolates_failures() {
        let backend = FailingBackend::new();
        backend.fail_delete("incident-dashboard-v0.8");
        let caches = CacheStorage::new(backend);
        for name in ["incident-dashboard-v0.8", "incident-dashboard-v0.9", "incident-dashboard-v1.0"] {
            caches.open(name).await.unwrap();
        }

        let report = lifecycle(MockFetcher::new(), caches.clone())
            .collect_generations()
            .await;

        assert_eq!(report.deleted, vec!["incident-dashboard-v0.9"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "incident-dashboard-v0.8");
        assert_eq!(
            caches.keys().await.unwrap(),
            vec!["incident-dashboard-v0.8", "incident-dashboard-v1.0"]
        );
    }

    #[tokio::test]
    async fn test_collect_generations_survives_listing_failure() {
        let backend = FailingBackend::new();
        backend.fail_names();

        let report = lifecycle(MockFetcher::new(), CacheStorage::new(backend))
            .collect_generations()
            .await;

        assert_eq!(report.current, "incident-dashboard-v1.0");
        assert!(report.deleted.is_empty());
    }
}
