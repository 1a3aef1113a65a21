//! Push notifications.
//!
//! A push payload becomes a [`Notification`] with `view` and `dismiss`
//! actions, shown through a [`NotificationSink`] supplied by the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use firewatch_core::WorkerConfig;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clients::Client;
use crate::{Result, ServiceWorkerError};

/// Action id that opens the dashboard.
pub const VIEW_ACTION: &str = "view";
/// Action id that only closes the notification.
pub const DISMISS_ACTION: &str = "dismiss";

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Parsed push message.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    /// The whole payload, unknown fields included.
    pub data: Value,
}

impl PushPayload {
    /// Parse a JSON push message. Non-object JSON carries no title or body.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let data: Value = serde_json::from_slice(bytes)
            .map_err(|e| ServiceWorkerError::Push(format!("invalid payload: {}", e)))?;

        let field = |name: &str| {
            data.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            title: field("title"),
            body: field("body"),
            data,
        })
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A notification as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: Value,
    pub actions: Vec<NotificationAction>,
}

/// What a notification click led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// A new window was opened.
    Opened { client_id: String, url: String },
    /// An existing window at the target URL was focused.
    Focused { client_id: String },
    /// The notification was closed and nothing else happened.
    Closed,
}

impl ClickOutcome {
    pub(crate) fn from_client(client: &Client, opened: bool) -> Self {
        if opened {
            Self::Opened {
                client_id: client.id.clone(),
                url: client.url.to_string(),
            }
        } else {
            Self::Focused {
                client_id: client.id.clone(),
            }
        }
    }
}

/// Result of a background sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tag was recognized and its work finished.
    Completed,
    /// Unknown tag.
    Ignored,
}

/// Displays notifications on behalf of the worker.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification) -> BoxFuture<'_, Result<()>>;

    fn close(&self, id: NotificationId) -> BoxFuture<'_, Result<()>>;
}

/// Sink that keeps notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    shown: Mutex<Vec<Notification>>,
    open: Mutex<Vec<NotificationId>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification shown so far.
    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Notifications shown and not yet closed.
    pub fn open_notifications(&self) -> Vec<Notification> {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        self.shown()
            .into_iter()
            .filter(|n| open.contains(&n.id))
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn show(&self, notification: Notification) -> BoxFuture<'_, Result<()>> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.id);
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
        Box::pin(future::ready(Ok(())))
    }

    fn close(&self, id: NotificationId) -> BoxFuture<'_, Result<()>> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|open| *open != id);
        Box::pin(future::ready(Ok(())))
    }
}

/// Builds and shows notifications from push payloads.
#[derive(Clone)]
pub struct Notifier {
    config: Arc<WorkerConfig>,
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(config: Arc<WorkerConfig>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { config, sink }
    }

    /// Build the notification for a payload.
    pub fn build(&self, payload: PushPayload) -> Notification {
        let defaults = &self.config.notification;
        Notification {
            id: NotificationId::new(),
            title: payload.title.unwrap_or_else(|| defaults.default_title.clone()),
            body: payload.body.unwrap_or_else(|| defaults.default_body.clone()),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: payload.data,
            actions: vec![
                NotificationAction {
                    action: VIEW_ACTION.to_string(),
                    title: defaults.view_title.clone(),
                },
                NotificationAction {
                    action: DISMISS_ACTION.to_string(),
                    title: defaults.dismiss_title.clone(),
                },
            ],
        }
    }

    /// Handle a push message. A push without data shows nothing.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Result<Option<Notification>> {
        let Some(bytes) = data else {
            debug!("Push without data, nothing to show");
            return Ok(None);
        };

        let notification = self.build(PushPayload::parse(bytes)?);
        self.sink.show(notification.clone()).await?;
        info!(id = ?notification.id, title = %notification.title, "Notification shown");
        Ok(Some(notification))
    }

    /// Close a notification.
    pub async fn close(&self, id: NotificationId) -> Result<()> {
        self.sink.close(id).await
    }
}
