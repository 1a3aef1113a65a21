//! Cache storage backends: in-memory and SQLite.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use firewatch_net::{Response, ResponseType};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheEntry, RequestKey};
use crate::{Result, ServiceWorkerError};

/// Storage for named caches.
///
/// Implementations must make `put_all` atomic: readers see either none or
/// all of the entries in one call, never a partially written entry.
pub trait CacheBackend: Send + Sync {
    /// Create a cache if it does not exist.
    fn create(&self, cache: &str) -> Result<()>;

    /// Check if a cache exists.
    fn has(&self, cache: &str) -> Result<bool>;

    /// Delete a cache and its entries. Returns whether it existed.
    fn delete(&self, cache: &str) -> Result<bool>;

    /// All cache names in creation order.
    fn names(&self) -> Result<Vec<String>>;

    /// Look up one entry.
    fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

    /// Write entries, replacing any with the same key. Fails with
    /// `CacheError` if the cache does not exist; only `create` adds caches.
    fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// Remove one entry. Returns whether it existed.
    fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool>;

    /// All keys stored in a cache.
    fn keys(&self, cache: &str) -> Result<Vec<RequestKey>>;
}

// ==================== Memory ====================

type Entries = HashMap<RequestKey, CacheEntry>;

/// Volatile backend; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<Vec<(String, Entries)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn create(&self, cache: &str) -> Result<()> {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        if !caches.iter().any(|(name, _)| name == cache) {
            caches.push((cache.to_string(), Entries::new()));
        }
        Ok(())
    }

    fn has(&self, cache: &str) -> Result<bool> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        Ok(caches.iter().any(|(name, _)| name == cache))
    }

    fn delete(&self, cache: &str) -> Result<bool> {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        let before = caches.len();
        caches.retain(|(name, _)| name != cache);
        Ok(caches.len() != before)
    }

    fn names(&self) -> Result<Vec<String>> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        Ok(caches.iter().map(|(name, _)| name.clone()).collect())
    }

    fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        Ok(caches
            .iter()
            .find(|(name, _)| name == cache)
            .and_then(|(_, entries)| entries.get(key).cloned()))
    }

    fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        let (_, stored) = caches
            .iter_mut()
            .find(|(name, _)| name == cache)
            .ok_or_else(|| missing_cache(cache))?;
        for entry in entries {
            stored.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool> {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        Ok(caches
            .iter_mut()
            .find(|(name, _)| name == cache)
            .map(|(_, entries)| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    fn keys(&self, cache: &str) -> Result<Vec<RequestKey>> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        Ok(caches
            .iter()
            .find(|(name, _)| name == cache)
            .map(|(_, entries)| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}

fn missing_cache(cache: &str) -> ServiceWorkerError {
    ServiceWorkerError::CacheError(format!("cache {} does not exist", cache))
}

// ==================== SQLite ====================

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS entries (
    cache_id INTEGER NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (cache_id, method, url),
    FOREIGN KEY (cache_id) REFERENCES caches(id) ON DELETE CASCADE
);
"#;

/// Version 2 stores header values as raw bytes. Version 1 rows cannot be
/// decoded, so every store is dropped and repopulated on the next install.
const MIGRATE_V2: &str = "DELETE FROM caches;";

/// Backend that keeps caches in a SQLite database, so stored assets survive
/// a host restart.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceWorkerError::CacheError(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Default database location under the user data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("firewatch").join("cache.db"))
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )?;

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            debug!(from = version, to = SCHEMA_VERSION, "Migrating cache database");
            if version < 1 {
                conn.execute_batch(SCHEMA_V1)?;
            } else {
                conn.execute_batch(MIGRATE_V2)?;
            }
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?, strftime('%s','now'))",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cache_id(conn: &Connection, cache: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM caches WHERE name = ?",
            params![cache],
            |row| row.get(0),
        )
        .optional()?)
}

fn ensure_cache(conn: &Connection, cache: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache],
    )?;
    cache_id(conn, cache)?
        .ok_or_else(|| ServiceWorkerError::CacheError(format!("cache {} vanished", cache)))
}

fn response_type_name(response_type: ResponseType) -> &'static str {
    match response_type {
        ResponseType::Basic => "basic",
        ResponseType::Cors => "cors",
        ResponseType::Default => "default",
        ResponseType::Error => "error",
        ResponseType::Opaque => "opaque",
    }
}

fn parse_response_type(name: &str) -> ResponseType {
    match name {
        "basic" => ResponseType::Basic,
        "cors" => ResponseType::Cors,
        "error" => ResponseType::Error,
        "opaque" => ResponseType::Opaque,
        _ => ResponseType::Default,
    }
}

/// Headers as a JSON list of `[name, [bytes...]]` pairs. Values keep their
/// raw bytes since they need not be UTF-8.
fn encode_headers(headers: &HeaderMap) -> Result<String> {
    let pairs: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
        .collect();
    serde_json::to_string(&pairs).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))
}

fn decode_headers(json: &str) -> Result<HeaderMap> {
    let pairs: Vec<(String, Vec<u8>)> =
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name = HeaderName::try_from(name.as_str()).map_err(|e| {
            ServiceWorkerError::CacheError(format!("stored header name {:?}: {}", name, e))
        })?;
        let value = HeaderValue::from_bytes(&value).map_err(|e| {
            ServiceWorkerError::CacheError(format!("stored value of header {}: {}", name, e))
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

struct EntryRow {
    method: String,
    url: String,
    response_url: Option<String>,
    status: u16,
    response_type: String,
    headers: String,
    body: Vec<u8>,
    cached_at: i64,
}

impl EntryRow {
    fn into_entry(self) -> Result<CacheEntry> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut response = Response::new(status, Bytes::from(self.body))
            .with_type(parse_response_type(&self.response_type));
        if let Some(url) = self.response_url.as_deref().and_then(|u| Url::parse(u).ok()) {
            response = response.with_url(url);
        }
        response.headers = decode_headers(&self.headers)?;

        Ok(CacheEntry {
            key: RequestKey {
                method: self.method,
                url: self.url,
            },
            response,
            cached_at: self.cached_at as u64,
        })
    }
}

impl CacheBackend for SqliteBackend {
    fn create(&self, cache: &str) -> Result<()> {
        ensure_cache(&self.conn(), cache).map(|_| ())
    }

    fn has(&self, cache: &str) -> Result<bool> {
        Ok(cache_id(&self.conn(), cache)?.is_some())
    }

    fn delete(&self, cache: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM caches WHERE name = ?", params![cache])?;
        Ok(deleted > 0)
    }

    fn names(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT e.method, e.url, e.response_url, e.status, e.response_type,
                        e.headers, e.body, e.cached_at
                 FROM entries e INNER JOIN caches c ON c.id = e.cache_id
                 WHERE c.name = ? AND e.method = ? AND e.url = ?",
                params![cache, key.method, key.url],
                |row| {
                    Ok(EntryRow {
                        method: row.get(0)?,
                        url: row.get(1)?,
                        response_url: row.get(2)?,
                        status: row.get(3)?,
                        response_type: row.get(4)?,
                        headers: row.get(5)?,
                        body: row.get(6)?,
                        cached_at: row.get(7)?,
                    })
                },
            )
            .optional()?;

        row.map(EntryRow::into_entry).transpose()
    }

    fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = cache_id(&tx, cache)?.ok_or_else(|| missing_cache(cache))?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO entries
                 (cache_id, method, url, response_url, status, response_type, headers, body, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for entry in &entries {
                let response = &entry.response;
                stmt.execute(params![
                    id,
                    entry.key.method,
                    entry.key.url,
                    response.url.as_ref().map(Url::as_str),
                    response.status.as_u16(),
                    response_type_name(response.response_type),
                    encode_headers(&response.headers)?,
                    response.bytes().as_ref(),
                    entry.cached_at as i64,
                ])?;
            }
        }

        tx.commit()?;
        debug!(cache, count = entries.len(), "Stored cache entries");
        Ok(())
    }

    fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM entries WHERE method = ? AND url = ?
             AND cache_id = (SELECT id FROM caches WHERE name = ?)",
            params![key.method, key.url, cache],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self, cache: &str) -> Result<Vec<RequestKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.method, e.url FROM entries e INNER JOIN caches c ON c.id = e.cache_id
             WHERE c.name = ? ORDER BY e.rowid",
        )?;
        let keys = stmt
            .query_map(params![cache], |row| {
                Ok(RequestKey {
                    method: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
