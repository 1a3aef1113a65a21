//! Network fetcher backed by reqwest.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{NetError, Request, RequestMode, Response, ResponseType};

/// Anything that can perform a network fetch.
///
/// This is the only path the worker's strategies use to reach the network,
/// which keeps them testable without sockets.
pub trait Fetcher: Send + Sync {
    /// Fetch a request. HTTP error statuses are responses, not errors.
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Firewatch/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetcher for a worker running on behalf of one application origin.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for the application served from `scope`.
    pub fn new(scope: &Url, config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %scope.origin().ascii_serialization(), "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin: scope.origin(),
        })
    }

    /// Classify a response by where it finally came from.
    fn response_type(&self, request: &Request, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.origin {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }

    async fn execute(&self, request: Request) -> Result<Response, NetError> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(NetError::InvalidUrl(request.url.to_string()));
        }
        if request.mode == RequestMode::SameOrigin && request.url.origin() != self.origin {
            return Err(NetError::RequestFailed(format!(
                "same-origin request to {}",
                request.url.origin().ascii_serialization()
            )));
        }

        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let response_type = self.response_type(&request, &url);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            body_len = body.len(),
            "Response received"
        );

        let mut snapshot = Response::new(status, body)
            .with_url(url)
            .with_type(response_type);
        snapshot.headers = headers;
        Ok(snapshot)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.execute(request))
    }
}
