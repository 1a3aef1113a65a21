//! Request classification.

use firewatch_core::WorkerConfig;
use firewatch_net::Request;
use url::Url;

/// Which strategy serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Incident data from a live-data host; network first.
    LiveData,
    /// Application shell and assets; cache first.
    StaticAsset,
}

/// A configured live-data host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches one hostname.
    Exact(String),
    /// `*.example.com`: matches any subdomain of `example.com`, not the
    /// domain itself.
    Subdomain(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(domain) => Self::Subdomain(domain.to_string()),
            None => Self::Exact(pattern),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(name) => host.eq_ignore_ascii_case(name),
            Self::Subdomain(domain) => {
                let host = host.to_ascii_lowercase();
                host.len() > domain.len() + 1
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
            }
        }
    }
}

/// Routes requests to a [`RequestClass`].
#[derive(Debug, Clone)]
pub struct Router {
    live_data: Vec<HostPattern>,
}

impl Router {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            live_data: config
                .live_data_hosts
                .iter()
                .map(|h| HostPattern::parse(h))
                .collect(),
        }
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        self.classify_url(&request.url)
    }

    /// Classify by URL host. URLs without a host are static assets.
    pub fn classify_url(&self, url: &Url) -> RequestClass {
        match url.host_str() {
            Some(host) if self.live_data.iter().any(|p| p.matches(host)) => RequestClass::LiveData,
            _ => RequestClass::StaticAsset,
        }
    }
}
