//! End-to-end worker behavior against a mock origin.

use std::sync::Arc;

use bytes::Bytes;
use firewatch_core::WorkerConfig;
use firewatch_net::{HttpFetcher, LoaderConfig, Request};
use firewatch_sw::{
    CacheStorage, ClickOutcome, EventOutcome, OfflineWorker, RecordingSink, ServiceWorkerError,
    SqliteBackend, WorkerEvent,
};
use http::StatusCode;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST: [&str; 3] = ["/", "/index.html", "/manifest.json"];

/// Nothing listens on port 1.
const UNREACHABLE: &str = "http://127.0.0.1:1/";

fn config_for(server: &MockServer, version: &str) -> WorkerConfig {
    WorkerConfig {
        version: version.to_string(),
        scope: Url::parse(&format!("{}/", server.uri())).unwrap(),
        precache: MANIFEST.iter().map(|p| p.to_string()).collect(),
        ..WorkerConfig::default()
    }
}

async fn serve_app(server: &MockServer) {
    for asset in MANIFEST {
        Mock::given(method("GET"))
            .and(path(asset))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(format!("<app {asset}>"), "text/html"),
            )
            .mount(server)
            .await;
    }
}

fn worker(config: WorkerConfig, caches: CacheStorage) -> (OfflineWorker, Arc<RecordingSink>) {
    let fetcher = HttpFetcher::new(&config.scope, LoaderConfig::default()).unwrap();
    let sink = Arc::new(RecordingSink::new());
    let (worker, _events) =
        OfflineWorker::new(Arc::new(config), Arc::new(fetcher), caches, sink.clone());
    (worker, sink)
}

fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), path)).unwrap()
}

#[tokio::test]
async fn static_hit_is_served_without_network() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    let (worker, _) = worker(config_for(&server, "v1"), CacheStorage::in_memory());
    worker.start().await.unwrap();

    let requests_after_install = server.received_requests().await.unwrap().len();
    let response = worker
        .handle_fetch(Request::get(url(&server, "/index.html")))
        .await
        .unwrap();

    assert_eq!(response.text().unwrap(), "<app /index.html>");
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_after_install
    );
}

#[tokio::test]
async fn live_data_never_errors() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/incidents"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = config_for(&server, "v1");
    config.live_data_hosts = vec!["127.0.0.1".to_string()];
    let (worker, _) = worker(config, CacheStorage::in_memory());
    worker.start().await.unwrap();

    let response = worker
        .handle_fetch(Request::get(url(&server, "/api/incidents")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["message"], "API unavailable - check connection");
}

#[tokio::test]
async fn navigation_falls_back_to_shell_when_offline() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    let (worker, _) = worker(config_for(&server, "v1"), CacheStorage::in_memory());
    worker.start().await.unwrap();

    let unreachable = Url::parse(UNREACHABLE).unwrap().join("/incidents/42").unwrap();
    let response = worker
        .handle_fetch(Request::navigate(unreachable))
        .await
        .unwrap();

    assert_eq!(response.text().unwrap(), "<app /index.html>");
}

#[tokio::test]
async fn failed_install_leaves_no_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("shell"))
        .mount(&server)
        .await;

    let caches = CacheStorage::in_memory();
    let (worker, _) = worker(config_for(&server, "v1"), caches.clone());

    let result = worker.dispatch(WorkerEvent::Install).await;

    assert!(matches!(result, Err(ServiceWorkerError::InstallFailed { .. })));
    assert!(caches.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn activation_collects_old_generations() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    let caches = CacheStorage::in_memory();
    for old in ["incident-dashboard-v1", "incident-dashboard-v2"] {
        caches.open(old).await.unwrap();
    }

    let (worker, _) = worker(config_for(&server, "v3"), caches.clone());
    let EventOutcome::Installed(report) = worker.dispatch(WorkerEvent::Install).await.unwrap() else {
        panic!("expected install report");
    };
    assert_eq!(report.entries, MANIFEST.len());
    worker.dispatch(WorkerEvent::Activate).await.unwrap();

    assert_eq!(caches.keys().await.unwrap(), vec!["incident-dashboard-v3"]);
}

#[tokio::test]
async fn store_survives_restart_with_sqlite() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    {
        let caches = CacheStorage::new(Arc::new(SqliteBackend::open(&db).unwrap()));
        let (worker, _) = worker(config_for(&server, "v1"), caches);
        worker.start().await.unwrap();
    }

    let scope = Url::parse(&format!("{}/", server.uri())).unwrap();
    let requests_before_restart = server.received_requests().await.unwrap().len();

    let caches = CacheStorage::new(Arc::new(SqliteBackend::open(&db).unwrap()));
    let mut config = WorkerConfig::default();
    config.version = "v1".to_string();
    config.scope = scope.clone();
    let (worker, _) = worker(config, caches);

    assert!(worker.resume().await.unwrap());
    let response = worker
        .handle_fetch(Request::navigate(scope.join("/").unwrap()))
        .await
        .unwrap();
    assert_eq!(response.text().unwrap(), "<app />");
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_before_restart
    );
}

#[tokio::test]
async fn push_then_view_opens_dashboard() {
    let server = MockServer::start().await;
    serve_app(&server).await;
    let (worker, sink) = worker(config_for(&server, "v1"), CacheStorage::in_memory());

    let payload = Bytes::from_static(br#"{"title":"Fire","body":"Engine 3 dispatched"}"#);
    let EventOutcome::Push(Some(notification)) =
        worker.dispatch(WorkerEvent::Push(Some(payload))).await.unwrap()
    else {
        panic!("expected a notification");
    };
    assert_eq!(notification.title, "Fire");
    assert_eq!(notification.body, "Engine 3 dispatched");
    assert_eq!(notification.actions.len(), 2);

    let outcome = worker
        .dispatch(WorkerEvent::NotificationClick {
            notification,
            action: Some("view".to_string()),
        })
        .await
        .unwrap();

    let EventOutcome::Click(ClickOutcome::Opened { url, .. }) = outcome else {
        panic!("expected a window to open");
    };
    assert!(url.ends_with("/?notification=true"));
    assert!(sink.open_notifications().is_empty());
}
