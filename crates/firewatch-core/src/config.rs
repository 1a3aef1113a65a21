//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{FirewatchError, FirewatchResult};

const DEFAULT_SCOPE: &str = "http://localhost:8080/";

/// Immutable worker configuration.
///
/// Built once at startup and shared (usually as `Arc<WorkerConfig>`) by the
/// lifecycle manager, the router, and the strategy executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fixed component of the store name
    pub cache_prefix: String,

    /// Deployment version; bumping it invalidates every cached static asset
    pub version: String,

    /// Origin and path the worker controls. Manifest paths resolve against it.
    pub scope: Url,

    /// Assets that must be stored at install time, in order
    pub precache: Vec<String>,

    /// Stored document served to failed page navigations
    pub shell_path: String,

    /// Hosts whose requests are live data (network first, never cached)
    pub live_data_hosts: Vec<String>,

    /// Message placed in the offline fallback body for live-data requests
    pub offline_message: String,

    /// Background-sync tag reserved for data reconciliation
    pub sync_tag: String,

    /// Notification defaults
    pub notification: NotificationConfig,
}

/// Defaults applied to push notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title used when the push payload has none
    pub default_title: String,

    /// Body used when the push payload has none
    pub default_body: String,

    /// Icon path
    pub icon: String,

    /// Badge path
    pub badge: String,

    /// Vibration pattern in milliseconds (on, off, on, ...)
    pub vibrate: Vec<u32>,

    /// Path opened by the "view" action
    pub open_path: String,

    /// Label of the "view" action
    pub view_title: String,

    /// Label of the "dismiss" action
    pub dismiss_title: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "incident-dashboard".to_string(),
            version: "v1.0".to_string(),
            scope: Url::parse(DEFAULT_SCOPE).expect("default scope is a valid URL"),
            precache: [
                "/",
                "/index.html",
                "/manifest.json",
                "/icon-72.png",
                "/icon-96.png",
                "/icon-128.png",
                "/icon-144.png",
                "/icon-152.png",
                "/icon-192.png",
                "/icon-384.png",
                "/icon-512.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            shell_path: "/index.html".to_string(),
            live_data_hosts: vec![
                "sizeup.firstduesizeup.com".to_string(),
                "corsproxy.io".to_string(),
            ],
            offline_message: "API unavailable - check connection".to_string(),
            sync_tag: "incident-sync".to_string(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Incident Alert".to_string(),
            default_body: "New incident alert".to_string(),
            icon: "/icon-192.png".to_string(),
            badge: "/icon-72.png".to_string(),
            vibrate: vec![300, 100, 400],
            open_path: "/?notification=true".to_string(),
            view_title: "View Details".to_string(),
            dismiss_title: "Dismiss".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Name of the current store: fixed prefix plus version suffix.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Resolve a path (or absolute URL) against the scope.
    pub fn resolve(&self, path: &str) -> FirewatchResult<Url> {
        Ok(self.scope.join(path)?)
    }

    /// Resolve the asset manifest, preserving order.
    pub fn precache_urls(&self) -> FirewatchResult<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// URL of the offline navigation shell.
    pub fn shell_url(&self) -> FirewatchResult<Url> {
        self.resolve(&self.shell_path)
    }

    /// URL opened when a notification's "view" action is chosen.
    pub fn notification_url(&self) -> FirewatchResult<Url> {
        self.resolve(&self.notification.open_path)
    }

    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> FirewatchResult<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(FirewatchError::config("cache_prefix must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(FirewatchError::config("version must not be empty"));
        }
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(FirewatchError::config(format!(
                "scope must be an http(s) URL, got {}",
                self.scope
            )));
        }
        if self.precache.is_empty() {
            return Err(FirewatchError::config("precache manifest must not be empty"));
        }
        self.precache_urls()?;
        self.shell_url()?;
        self.notification_url()?;
        Ok(())
    }

    /// Load configuration.
    ///
    /// Search order:
    /// 1. Explicit path if provided (must exist)
    /// 2. `$XDG_CONFIG_HOME/firewatch/worker.json`
    /// 3. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> FirewatchResult<Self> {
        let path = match explicit_path {
            Some(p) if p.exists() => Some(p.to_path_buf()),
            Some(p) => {
                return Err(FirewatchError::config(format!(
                    "Config file not found: {}",
                    p.display()
                )))
            }
            None => Self::default_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(p) => {
                tracing::debug!(path = %p.display(), "Loading worker configuration");
                Self::load_from_path(&p)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Default configuration file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("firewatch").join("worker.json"))
    }

    fn load_from_path(path: &Path) -> FirewatchResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            FirewatchError::config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}
