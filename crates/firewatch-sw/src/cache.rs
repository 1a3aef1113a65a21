//! Versioned response store.
//!
//! [`CacheStorage`] is the set of named stores; a [`Cache`] is a handle to
//! one of them. Both are cheap to clone and run backend calls on the
//! blocking pool, so a SQLite write never stalls a fetch in flight.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use firewatch_net::{Request, Response};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::{CacheBackend, MemoryBackend};
use crate::{Result, ServiceWorkerError};

/// Identity of a stored request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Build a key for a method and URL.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Build the key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Build the key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored request/response pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub response: Response,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `key`.
    pub fn new(key: RequestKey, response: Response) -> Self {
        Self {
            key,
            response,
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Run a backend call on the blocking pool.
async fn blocking<T, F>(backend: &Arc<dyn CacheBackend>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn CacheBackend) -> Result<T> + Send + 'static,
{
    let backend = Arc::clone(backend);
    tokio::task::spawn_blocking(move || op(backend.as_ref()))
        .await
        .map_err(|e| ServiceWorkerError::CacheError(format!("storage task failed: {}", e)))?
}

/// Validate that a request/response pair may be stored.
fn check_storable(request: &Request, response: &Response) -> Result<()> {
    if request.method != Method::GET {
        return Err(ServiceWorkerError::CacheError(format!(
            "only GET requests can be stored, got {}",
            request.method
        )));
    }
    if response.status == StatusCode::PARTIAL_CONTENT {
        return Err(ServiceWorkerError::CacheError(
            "partial responses cannot be stored".to_string(),
        ));
    }
    Ok(())
}

/// A handle to one named store.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

impl Cache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Only GET requests ever match.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if request.method != Method::GET {
            return Ok(None);
        }
        self.match_key(RequestKey::from_request(request)).await
    }

    /// Match a GET of `url`.
    pub async fn match_url(&self, url: &Url) -> Result<Option<Response>> {
        self.match_key(RequestKey::get(url)).await
    }

    async fn match_key(&self, key: RequestKey) -> Result<Option<Response>> {
        let name = self.name.clone();
        let entry = blocking(&self.backend, move |b| b.get(&name, &key)).await?;
        Ok(entry.map(|e| e.response))
    }

    /// Store a response, replacing any entry with the same identity.
    pub async fn put(&self, request: &Request, response: Response) -> Result<()> {
        self.put_all(vec![(request.clone(), response)]).await
    }

    /// Store several responses in one atomic write.
    pub async fn put_all(&self, pairs: Vec<(Request, Response)>) -> Result<()> {
        let mut entries = Vec::with_capacity(pairs.len());
        for (request, response) in pairs {
            check_storable(&request, &response)?;
            entries.push(CacheEntry::new(RequestKey::from_request(&request), response));
        }

        let name = self.name.clone();
        blocking(&self.backend, move |b| b.put_all(&name, entries)).await
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        let name = self.name.clone();
        let key = RequestKey::from_request(request);
        blocking(&self.backend, move |b| b.remove(&name, &key)).await
    }

    /// Get all stored request identities.
    pub async fn keys(&self) -> Result<Vec<RequestKey>> {
        let name = self.name.clone();
        blocking(&self.backend, move |b| b.keys(&name)).await
    }
}

/// The set of named stores.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    /// Create cache storage over a backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Create volatile in-memory cache storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        let owned = name.to_string();
        blocking(&self.backend, move |b| b.create(&owned)).await?;
        Ok(self.handle(name))
    }

    /// Get a handle to an existing cache without creating it.
    pub async fn get(&self, name: &str) -> Result<Option<Cache>> {
        Ok(self.has(name).await?.then(|| self.handle(name)))
    }

    fn handle(&self, name: &str) -> Cache {
        Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        blocking(&self.backend, move |b| b.has(&name)).await
    }

    /// Delete a cache and every entry in it.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        blocking(&self.backend, move |b| b.delete(&name)).await
    }

    /// Get all cache names in creation order.
    pub async fn keys(&self) -> Result<Vec<String>> {
        blocking(&self.backend, |b| b.names()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firewatch_net::ResponseType;

    fn url(path: &str) -> Url {
        Url::parse("http://localhost:8080/").unwrap().join(path).unwrap()
    }

    fn basic(body: &'static str) -> Response {
        Response::new(StatusCode::OK, body).with_type(ResponseType::Basic)
    }

    #[test]
    fn test_request_key_drops_fragment() {
        let a = RequestKey::get(&url("/index.html#top"));
        let b = RequestKey::get(&url("/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET http://localhost:8080/index.html");
    }

    #[test]
    fn test_request_key_keeps_query() {
        let a = RequestKey::get(&url("/?notification=true"));
        let b = RequestKey::get(&url("/"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cache() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();

        let request = Request::get(url("/style.css"));
        cache.put(&request, basic("body{}")).await.unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "body{}");
        assert!(cache.match_url(&url("/other.css")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_whole_entry() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let request = Request::get(url("/app.js"));

        cache.put(&request, basic("old")).await.unwrap();
        cache.put(&request, basic("new")).await.unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "new");
        assert_eq!(cache.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_get_is_never_stored_or_matched() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::post(url("/api"), bytes::Bytes::from_static(b"{}"));

        assert!(matches!(
            cache.put(&post, basic("x")).await,
            Err(ServiceWorkerError::CacheError(_))
        ));
        assert!(cache.match_request(&post).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_content_rejected() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let request = Request::get(url("/video.mp4"));
        let partial = Response::new(StatusCode::PARTIAL_CONTENT, "chunk");

        assert!(cache.put(&request, partial).await.is_err());
    }

    #[tokio::test]
    async fn test_put_all_rejects_whole_batch() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let good = Request::get(url("/a.js"));
        let bad = Request::post(url("/b"), bytes::Bytes::new());

        let result = cache
            .put_all(vec![(good.clone(), basic("a")), (bad, basic("b"))])
            .await;

        assert!(result.is_err());
        assert!(cache.match_request(&good).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let request = Request::get(url("/style.css"));

        cache.put(&request, basic("x")).await.unwrap();
        assert!(cache.delete(&request).await.unwrap());
        assert!(cache.match_request(&request).await.unwrap().is_none());
        assert!(!cache.delete(&request).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::in_memory();

        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();
        assert!(storage.has("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let storage = CacheStorage::in_memory();

        assert!(storage.get("v1").await.unwrap().is_none());
        assert!(storage.keys().await.unwrap().is_empty());

        storage.open("v1").await.unwrap();
        assert_eq!(storage.get("v1").await.unwrap().unwrap().name(), "v1");
    }

    #[tokio::test]
    async fn test_late_put_through_deleted_handle() {
        let storage = CacheStorage::in_memory();
        let old = storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();
        storage.delete("v1").await.unwrap();

        let result = old.put(&Request::get(url("/late.js")), basic("late")).await;

        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        assert_eq!(storage.keys().await.unwrap(), vec!["v2"]);
    }
}
