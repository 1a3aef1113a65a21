//! Test doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use firewatch_core::WorkerConfig;
use firewatch_net::{Fetcher, NetError, Request, Response, ResponseType};
use futures::future::{self, BoxFuture};
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use url::Url;

use crate::cache::{CacheEntry, RequestKey};
use crate::notify::{Notification, NotificationId, NotificationSink};
use crate::storage::{CacheBackend, MemoryBackend};
use crate::{Result, ServiceWorkerError};

/// Scripted fetcher that records every request it sees.
#[derive(Default)]
pub(crate) struct MockFetcher {
    routes: Mutex<HashMap<String, Option<Response>>>,
    calls: Mutex<Vec<Url>>,
    offline: Mutex<bool>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve a same-origin response.
    pub fn respond(&self, url: &Url, status: StatusCode, body: &'static str) {
        let response = Response::new(status, body)
            .with_url(url.clone())
            .with_type(ResponseType::Basic);
        self.respond_with(url, response);
    }

    pub fn respond_with(&self, url: &Url, response: Response) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Some(response));
    }

    /// Make requests for `url` fail with a network error.
    pub fn fail(&self, url: &Url) {
        self.routes.lock().unwrap().insert(url.to_string(), None);
    }

    /// Fail every request.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Serve every manifest asset with a small body.
    pub fn serve_manifest(&self, config: &WorkerConfig) {
        for url in config.precache_urls().unwrap() {
            self.respond(&url, StatusCode::OK, "asset");
        }
    }

    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, std::result::Result<Response, NetError>> {
        self.calls.lock().unwrap().push(request.url.clone());

        let result = if *self.offline.lock().unwrap() {
            Err(NetError::RequestFailed("offline".to_string()))
        } else {
            match self.routes.lock().unwrap().get(request.url.as_str()) {
                Some(Some(response)) => Ok(response.clone()),
                Some(None) => Err(NetError::RequestFailed("connection refused".to_string())),
                None => Err(NetError::RequestFailed(format!("no route for {}", request.url))),
            }
        };

        Box::pin(future::ready(result))
    }
}

/// Memory backend whose deletes fail for selected caches.
#[derive(Default)]
pub(crate) struct FailingBackend {
    inner: MemoryBackend,
    undeletable: Mutex<HashSet<String>>,
    fail_names: Mutex<bool>,
}

impl FailingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_delete(&self, cache: &str) {
        self.undeletable.lock().unwrap().insert(cache.to_string());
    }

    pub fn fail_names(&self) {
        *self.fail_names.lock().unwrap() = true;
    }
}

impl CacheBackend for FailingBackend {
    fn create(&self, cache: &str) -> Result<()> {
        self.inner.create(cache)
    }

    fn has(&self, cache: &str) -> Result<bool> {
        self.inner.has(cache)
    }

    fn delete(&self, cache: &str) -> Result<bool> {
        if self.undeletable.lock().unwrap().contains(cache) {
            return Err(ServiceWorkerError::CacheError(format!("{} is locked", cache)));
        }
        self.inner.delete(cache)
    }

    fn names(&self) -> Result<Vec<String>> {
        if *self.fail_names.lock().unwrap() {
            return Err(ServiceWorkerError::CacheError("enumeration failed".to_string()));
        }
        self.inner.names()
    }

    fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        self.inner.get(cache, key)
    }

    fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> Result<()> {
        self.inner.put_all(cache, entries)
    }

    fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool> {
        self.inner.remove(cache, key)
    }

    fn keys(&self, cache: &str) -> Result<Vec<RequestKey>> {
        self.inner.keys(cache)
    }
}

/// Sink that shows notifications but cannot close them.
#[derive(Default)]
pub(crate) struct StuckSink;

impl NotificationSink for StuckSink {
    fn show(&self, _notification: Notification) -> BoxFuture<'_, Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn close(&self, id: NotificationId) -> BoxFuture<'_, Result<()>> {
        Box::pin(future::ready(Err(ServiceWorkerError::NotFound(format!(
            "notification {:?}",
            id
        )))))
    }
}

/// Absolute URL under the default scope.
pub(crate) fn app_url(path: &str) -> Url {
    WorkerConfig::default().resolve(path).unwrap()
}
