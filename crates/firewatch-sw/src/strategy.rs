//! Fetch strategies.
//!
//! Live data is served network-first with a synthetic offline response;
//! everything else is served cache-first with backfill on a miss.

use std::sync::Arc;

use firewatch_core::WorkerConfig;
use firewatch_net::{Fetcher, NetError, Request, Response, ResponseType};
use http::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::keepalive::KeepAlive;
use crate::{Result, ServiceWorkerError};

/// The two fetch strategies, bound to one worker's collaborators.
#[derive(Clone)]
pub struct Strategies {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    keep_alive: KeepAlive,
}

impl Strategies {
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        keep_alive: KeepAlive,
    ) -> Self {
        Self {
            config,
            fetcher,
            caches,
            keep_alive,
        }
    }

    /// Fetch from the network; on failure answer with the offline response.
    ///
    /// Never touches the store and never fails.
    pub async fn network_first(&self, request: Request) -> Response {
        let url = request.url.clone();
        let result = match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => Ok(response),
            Ok(response) => Err(NetError::Status(response.status)),
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Live data unavailable, serving offline response");
                self.offline_response()
            }
        }
    }

    /// Synthetic response for unreachable live data.
    pub fn offline_response(&self) -> Response {
        Response::json_body(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({
                "error": "offline",
                "message": self.config.offline_message,
            }),
        )
    }

    /// Serve from the current store, falling back to the network.
    ///
    /// The store is never created here: if it is missing every lookup is a
    /// miss and nothing is backfilled.
    pub async fn cache_first(&self, request: Request) -> Result<Response> {
        let cache_name = self.config.cache_name();
        let cache = match self.caches.get(&cache_name).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(cache = %cache_name, error = %e, "Cache unavailable, treating as miss");
                None
            }
        };

        if let Some(cache) = &cache {
            match cache.match_request(&request).await {
                Ok(Some(hit)) => {
                    debug!(url = %request.url, cache = %cache_name, "Cache hit");
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss"),
            }
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                let cacheable =
                    response.status == StatusCode::OK && response.response_type == ResponseType::Basic;
                if let (true, Some(cache)) = (cacheable, cache) {
                    let copy = response.clone();
                    let url = request.url.clone();
                    self.keep_alive.wait_until(async move {
                        if let Err(e) = cache.put(&request, copy).await {
                            warn!(url = %url, error = %e, "Cache backfill failed");
                        }
                    });
                } else if cacheable {
                    debug!(url = %request.url, cache = %cache_name, "No current store, skipping backfill");
                } else {
                    debug!(
                        url = %request.url,
                        status = %response.status,
                        response_type = ?response.response_type,
                        "Response not cacheable"
                    );
                }
                Ok(response)
            }
            Err(e) if request.is_document() => {
                let Some(cache) = cache else {
                    return Err(ServiceWorkerError::Network(e));
                };
                let shell_url = self.config.shell_url()?;
                match cache.match_url(&shell_url).await {
                    Ok(Some(shell)) => {
                        debug!(url = %request.url, shell = %shell_url, "Offline, serving shell");
                        Ok(shell)
                    }
                    _ => Err(ServiceWorkerError::Network(e)),
                }
            }
            Err(e) => Err(ServiceWorkerError::Network(e)),
        }
    }
}
