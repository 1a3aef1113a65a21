//! The offline worker and its event dispatcher.

use std::sync::Arc;

use bytes::Bytes;
use firewatch_core::WorkerConfig;
use firewatch_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::keepalive::KeepAlive;
use crate::lifecycle::{
    GenerationReport, Lifecycle, PopulateReport, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};
use crate::notify::{ClickOutcome, Notification, NotificationSink, Notifier, SyncOutcome, VIEW_ACTION};
use crate::router::{RequestClass, Router};
use crate::strategy::Strategies;
use crate::{Result, ServiceWorkerError};

// ==================== Events ====================

/// An event delivered to the worker by the host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Bytes>),
    NotificationClick {
        notification: Notification,
        action: Option<String>,
    },
    Sync {
        tag: String,
    },
}

/// Result of handling a [`WorkerEvent`].
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed(PopulateReport),
    Activated(GenerationReport),
    Response(Response),
    Push(Option<Notification>),
    Click(ClickOutcome),
    Sync(SyncOutcome),
}

/// Effects the host must carry out, sent over the worker's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by this worker.
    ControllerChange { client_id: String },
    /// Open a window at `url`.
    OpenWindow { client_id: String, url: String },
    /// Bring an existing window to the front.
    Focus { client_id: String },
}

// ==================== Worker ====================

/// The offline worker for one application scope.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    sink: Arc<dyn NotificationSink>,
    lifecycle: Lifecycle,
    router: Router,
    strategies: Strategies,
    notifier: Notifier,
    keep_alive: KeepAlive,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    /// The registration entry this worker created in `install` or `resume`.
    id: RwLock<Option<ServiceWorkerId>>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl OfflineWorker {
    /// Create a worker. Host effects arrive on the returned receiver.
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        sink: Arc<dyn NotificationSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let registration = Arc::new(RwLock::new(ServiceWorkerRegistration::new(
            config.scope.clone(),
        )));
        Self::build(
            config,
            fetcher,
            caches,
            sink,
            registration,
            Arc::new(RwLock::new(Clients::new())),
            KeepAlive::new(),
        )
    }

    /// Create the worker for a new deployment of the same application.
    ///
    /// The successor shares this worker's store, registration and clients;
    /// once it activates, this worker becomes redundant and its store
    /// generation is collected.
    pub fn upgrade(
        &self,
        config: Arc<WorkerConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::build(
            config,
            Arc::clone(&self.fetcher),
            self.caches.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.registration),
            Arc::clone(&self.clients),
            self.keep_alive.clone(),
        )
    }

    fn build(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        sink: Arc<dyn NotificationSink>,
        registration: Arc<RwLock<ServiceWorkerRegistration>>,
        clients: Arc<RwLock<Clients>>,
        keep_alive: KeepAlive,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let lifecycle = Lifecycle::new(Arc::clone(&config), Arc::clone(&fetcher), caches.clone());
        let strategies = Strategies::new(
            Arc::clone(&config),
            Arc::clone(&fetcher),
            caches.clone(),
            keep_alive.clone(),
        );
        let notifier = Notifier::new(Arc::clone(&config), Arc::clone(&sink));
        let router = Router::new(&config);

        (
            Self {
                config,
                fetcher,
                caches,
                sink,
                lifecycle,
                router,
                strategies,
                notifier,
                keep_alive,
                registration,
                id: RwLock::new(None),
                clients,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        info!(worker = %worker_id, state = %new_state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    // ==================== Accessors ====================

    /// The store set this worker serves from.
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Shared registration for this scope.
    pub fn registration(&self) -> Arc<RwLock<ServiceWorkerRegistration>> {
        Arc::clone(&self.registration)
    }

    /// This worker's state, `Parsed` until it installs or resumes.
    pub async fn state(&self) -> ServiceWorkerState {
        let Some(id) = *self.id.read().await else {
            return ServiceWorkerState::Parsed;
        };
        self.registration
            .read()
            .await
            .get(id)
            .map(|w| w.state)
            .unwrap_or_default()
    }

    /// Whether this worker is the activated worker of its registration.
    async fn controls_scope(&self) -> bool {
        let Some(id) = *self.id.read().await else {
            return false;
        };
        self.registration
            .read()
            .await
            .get_active()
            .is_some_and(|w| w.id == id && w.state.can_intercept_fetch())
    }

    async fn active_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.get_active().map(|w| w.id)
    }

    /// Register a page with the worker.
    pub async fn add_client(&self, client: Client) {
        self.clients.write().await.add(client);
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    // ==================== Lifecycle ====================

    /// Install: populate the current store.
    ///
    /// On failure the installing worker becomes redundant and no store is
    /// created.
    pub async fn install(&self) -> Result<PopulateReport> {
        let worker_id = self
            .registration
            .write()
            .await
            .begin_install(self.config.cache_name());
        *self.id.write().await = Some(worker_id);
        self.emit_state(worker_id, ServiceWorkerState::Installing);

        match self.lifecycle.populate().await {
            Ok(report) => {
                self.registration.write().await.install_complete();
                self.emit_state(worker_id, ServiceWorkerState::Installed);
                Ok(report)
            }
            Err(e) => {
                error!(worker = %worker_id, error = %e, "Install failed");
                self.registration.write().await.install_failed(e.to_string());
                self.emit_state(worker_id, ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Activate the installed worker without waiting for open pages to
    /// close, collect old store generations and claim every page in scope.
    pub async fn activate(&self) -> Result<GenerationReport> {
        let own = *self.id.read().await;
        let (worker_id, replaced) = {
            let mut registration = self.registration.write().await;
            if own.is_none() || registration.waiting.as_ref().map(|w| w.id) != own {
                return Err(ServiceWorkerError::StateError(
                    "this worker is not installed and waiting".to_string(),
                ));
            }
            let replaced = registration.get_active().map(|w| w.id);
            let worker_id = registration.skip_waiting().ok_or_else(|| {
                ServiceWorkerError::StateError("no installed worker is waiting".to_string())
            })?;
            (worker_id, replaced)
        };

        if let Some(old) = replaced {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.emit_state(worker_id, ServiceWorkerState::Activating);

        let report = self.lifecycle.collect_generations().await;
        self.claim(worker_id).await;

        self.registration.write().await.activate();
        self.emit_state(worker_id, ServiceWorkerState::Activated);
        Ok(report)
    }

    async fn claim(&self, worker_id: ServiceWorkerId) {
        let claimed = self.clients.write().await.claim(worker_id, &self.config.scope);
        for client_id in claimed {
            debug!(client = %client_id, worker = %worker_id, "Claimed client");
            self.emit(ServiceWorkerEvent::ControllerChange { client_id });
        }
    }

    /// Install and activate.
    pub async fn start(&self) -> Result<GenerationReport> {
        self.install().await?;
        self.activate().await
    }

    /// Take over an already populated store without fetching the manifest
    /// again. Returns `false` if the current store does not exist.
    pub async fn resume(&self) -> Result<bool> {
        let cache_name = self.config.cache_name();
        if !self.caches.has(&cache_name).await? {
            return Ok(false);
        }

        let worker_id = {
            let mut registration = self.registration.write().await;
            let worker_id = registration.begin_install(cache_name.as_str());
            registration.install_complete();
            registration.skip_waiting();
            registration.activate();
            worker_id
        };
        *self.id.write().await = Some(worker_id);

        self.claim(worker_id).await;
        self.emit_state(worker_id, ServiceWorkerState::Activated);
        info!(cache = %cache_name, "Resumed from existing store");
        Ok(true)
    }

    // ==================== Events ====================

    /// Handle one event. This is the only entry point the host needs.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => self.handle_fetch(request).await.map(EventOutcome::Response),
            WorkerEvent::Push(data) => self
                .notifier
                .handle_push(data.as_deref())
                .await
                .map(EventOutcome::Push),
            WorkerEvent::NotificationClick {
                notification,
                action,
            } => self
                .handle_click(&notification, action.as_deref())
                .await
                .map(EventOutcome::Click),
            WorkerEvent::Sync { tag } => Ok(EventOutcome::Sync(self.handle_sync(&tag))),
        }
    }

    /// Answer a fetch. Unless this worker is the activated one, requests go
    /// straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<Response> {
        if !self.controls_scope().await {
            debug!(url = %request.url, "Worker not active, passing fetch through");
            return Ok(self.fetcher.fetch(request).await?);
        }

        match self.router.classify(&request) {
            RequestClass::LiveData => {
                debug!(url = %request.url, "Routing live data network-first");
                Ok(self.strategies.network_first(request).await)
            }
            RequestClass::StaticAsset => {
                debug!(url = %request.url, "Routing static asset cache-first");
                self.strategies.cache_first(request).await
            }
        }
    }

    /// Handle a notification click. The notification is always closed.
    pub async fn handle_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        if let Err(e) = self.notifier.close(notification.id).await {
            warn!(notification = ?notification.id, error = %e, "Failed to close notification");
        }

        if action != Some(VIEW_ACTION) {
            debug!(action = ?action, "Notification closed");
            return Ok(ClickOutcome::Closed);
        }

        let url = self.config.notification_url()?;
        let controller = self.active_id().await;
        let mut clients = self.clients.write().await;

        let existing = clients.find_window(&url).map(|c| c.id.clone());
        match existing {
            Some(id) => {
                let client = clients.focus(&id)?;
                self.emit(ServiceWorkerEvent::Focus {
                    client_id: client.id.clone(),
                });
                Ok(ClickOutcome::from_client(&client, false))
            }
            None => {
                let client = clients.open_window(url, controller);
                self.emit(ServiceWorkerEvent::OpenWindow {
                    client_id: client.id.clone(),
                    url: client.url.to_string(),
                });
                Ok(ClickOutcome::from_client(&client, true))
            }
        }
    }

    /// Handle a background sync tag.
    pub fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag == self.config.sync_tag {
            info!(tag, "Background sync completed");
            SyncOutcome::Completed
        } else {
            debug!(tag, "Ignoring unknown sync tag");
            SyncOutcome::Ignored
        }
    }

    // ==================== Termination ====================

    /// Wait for every background task, including tasks started by other
    /// background tasks. Returns how many were awaited.
    pub async fn idle(&self) -> usize {
        self.keep_alive.settle().await
    }

    /// Finish background work, then retire this worker if it is active.
    pub async fn terminate(&self) {
        let settled = self.idle().await;
        let own = *self.id.read().await;

        let retired = {
            let mut registration = self.registration.write().await;
            let is_own = own.is_some() && registration.active.as_ref().map(|w| w.id) == own;
            let active = if is_own { registration.active.take() } else { None };
            active.map(|mut worker| {
                worker.set_state(ServiceWorkerState::Redundant);
                let id = worker.id;
                registration.retired.push(worker);
                id
            })
        };

        if let Some(id) = retired {
            self.emit_state(id, ServiceWorkerState::Redundant);
        }
        info!(settled, "Worker terminated");
    }

    /// Drop background work without waiting. Pending cache backfills are
    /// lost.
    pub fn abort(&self) {
        if self.keep_alive.pending() > 0 {
            warn!(pending = self.keep_alive.pending(), "Aborting background tasks");
        }
        self.keep_alive.abort();
    }
}
