//! Event dispatch tying the caching, client and sync layers together.

use serde::Deserialize;
use std::sync::Arc;

use crate::cache::{
  ActivateReport, CacheLifecycleManager, CacheStorage, CacheStrategyEngine, Classifier,
  EntryLimits, InstallReport, WorkerState,
};
use crate::client::{ClientStack, RequestThrottler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{Fetcher, Request, Response};
use crate::offline::OfflineFallbackProvider;
use crate::sync::{BackgroundSyncCoordinator, SyncReport};

/// Messages sent by application pages.
///
/// Wire form: `{"type": "CACHE_URLS", "payload": {"urls": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  ClearCache,
  GetVersion,
  CacheUrls { urls: Vec<String> },
}

impl ControlMessage {
  pub fn from_json(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| Error::InvalidRequest(format!("bad control message: {}", e)))
  }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
  Install,
  Activate,
  Fetch(Request),
  Message(ControlMessage),
  Sync(String),
  PeriodicSync(String),
  Push(Vec<u8>),
}

/// Answer to a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
  Ack,
  Version { version: String, namespaces: Vec<String> },
  Cached { stored: usize },
  Failed(String),
}

#[derive(Debug)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Response(Response),
  /// Not intercepted; the request goes to the network untouched
  Passthrough,
  Reply(Reply),
  Synced(SyncReport),
  /// Handed to the UI layer
  Delegated,
  Failed(String),
}

/// One generation of the interception layer with everything it owns.
pub struct ServiceWorker {
  lifecycle: Arc<CacheLifecycleManager>,
  engine: CacheStrategyEngine,
  sync: BackgroundSyncCoordinator,
  fetcher: Arc<dyn Fetcher>,
  throttler: RequestThrottler,
}

impl ServiceWorker {
  /// Build the worker over `storage`, sending network traffic through
  /// `transport` wrapped in the retry and throttle layers.
  pub fn new(config: &Config, storage: Arc<dyn CacheStorage>, transport: Arc<dyn Fetcher>) -> Result<Self> {
    let origin = config.origin_url()?;
    let stack = ClientStack::new(transport, config);

    let lifecycle = Arc::new(CacheLifecycleManager::new(
      storage,
      origin.clone(),
      &config.cache_prefix,
      &config.version,
      config.precache.clone(),
    ));
    let engine = CacheStrategyEngine::new(
      lifecycle.clone(),
      Classifier::new(config, &origin),
      OfflineFallbackProvider::new(config.api_prefix.clone()),
      stack.fetcher.clone(),
    )
    .with_limits(EntryLimits {
      runtime: config.runtime_max_entries,
      image: config.image_max_entries,
    });
    let sync = BackgroundSyncCoordinator::new(
      lifecycle.clone(),
      engine.clone(),
      stack.fetcher.clone(),
      config.critical_endpoints.clone(),
    );

    tracing::debug!(origin = %origin, version = %config.version, "service worker constructed");
    Ok(Self {
      lifecycle,
      engine,
      sync,
      fetcher: stack.fetcher,
      throttler: stack.throttler,
    })
  }

  pub fn lifecycle(&self) -> &CacheLifecycleManager {
    &self.lifecycle
  }

  pub fn engine(&self) -> &CacheStrategyEngine {
    &self.engine
  }

  pub fn sync(&self) -> &BackgroundSyncCoordinator {
    &self.sync
  }

  pub fn throttler(&self) -> &RequestThrottler {
    &self.throttler
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  pub async fn dispatch(&self, event: ServiceEvent) -> Outcome {
    match event {
      ServiceEvent::Install => Outcome::Installed(self.lifecycle.install(self.fetcher.as_ref()).await),
      ServiceEvent::Activate => match self.lifecycle.activate() {
        Ok(report) => Outcome::Activated(report),
        Err(e) => {
          tracing::error!(error = %e, "activation failed");
          Outcome::Failed(e.to_string())
        }
      },
      ServiceEvent::Fetch(request) => {
        if !self.engine.intercepts(&request) {
          tracing::trace!(url = %request.url, "not intercepted");
          return Outcome::Passthrough;
        }
        Outcome::Response(self.engine.handle(request).await)
      }
      ServiceEvent::Message(message) => Outcome::Reply(self.on_message(message).await),
      ServiceEvent::Sync(tag) => Outcome::Synced(self.sync.on_sync(&tag).await),
      ServiceEvent::PeriodicSync(tag) => Outcome::Synced(self.sync.on_periodic(&tag).await),
      ServiceEvent::Push(payload) => {
        tracing::info!(bytes = payload.len(), "push received, delegating to UI");
        Outcome::Delegated
      }
    }
  }

  async fn on_message(&self, message: ControlMessage) -> Reply {
    tracing::debug!(?message, "control message");
    match message {
      ControlMessage::SkipWaiting => match self.lifecycle.skip_waiting() {
        Ok(_) => Reply::Ack,
        Err(e) => Reply::Failed(e.to_string()),
      },
      ControlMessage::ClearCache => match self.lifecycle.clear_primary() {
        Ok(_) => Reply::Ack,
        Err(e) => Reply::Failed(e.to_string()),
      },
      ControlMessage::GetVersion => Reply::Version {
        version: self.lifecycle.version().to_string(),
        namespaces: self
          .lifecycle
          .expected_names()
          .into_iter()
          .map(String::from)
          .collect(),
      },
      ControlMessage::CacheUrls { urls } => Reply::Cached {
        stored: self.engine.cache_urls(&urls).await,
      },
    }
  }

  /// Wait for outstanding background refreshes.
  pub async fn wait_idle(&self) {
    self.engine.tasks().wait_idle().await;
  }

  /// Abort outstanding background work.
  pub fn shutdown(&self) {
    let pending = self.engine.tasks().pending();
    self.engine.tasks().abort_all();
    tracing::debug!(aborted = pending, "service worker shut down");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Purpose, SqliteStorage};
  use crate::sync::SYNC_CRITICAL;
  use crate::testing::{get, MockFetcher, ORIGIN};
  use reqwest::header::ACCEPT;
  use reqwest::StatusCode;
  use std::time::Duration;

  fn config(version: &str) -> Config {
    Config {
      origin: ORIGIN.to_string(),
      version: version.to_string(),
      precache: vec!["/offline.html".into(), "/js/app.js".into()],
      ..Config::default()
    }
  }

  fn worker(storage: &Arc<dyn CacheStorage>, mock: &Arc<MockFetcher>, version: &str) -> ServiceWorker {
    ServiceWorker::new(&config(version), storage.clone(), mock.clone()).unwrap()
  }

  fn memory() -> Arc<dyn CacheStorage> {
    Arc::new(SqliteStorage::open_in_memory().unwrap())
  }

  async fn fetch(sw: &ServiceWorker, request: Request) -> Response {
    match sw.dispatch(ServiceEvent::Fetch(request)).await {
      Outcome::Response(response) => response,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn offline_with_empty_cache_serves_fallbacks() {
    let mock = Arc::new(MockFetcher::offline());
    let sw = worker(&memory(), &mock, "v1");

    let page = fetch(&sw, get("/dashboard.html").with_header(ACCEPT, "text/html")).await;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.text().contains("You are offline"));

    let api = fetch(&sw, get("/api/models")).await;
    assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(api.header("content-type"), Some("application/json"));
    let body: serde_json::Value = api.json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["error"], "Offline");
  }

  #[tokio::test]
  async fn navigation_is_stale_while_revalidate() {
    let mock = Arc::new(MockFetcher::new());
    let sw = worker(&memory(), &mock, "v1");
    mock.route_text("/dashboard", "first");
    assert_eq!(fetch(&sw, get("/dashboard")).await.text(), "first");

    mock.route_text("/dashboard", "second");
    assert_eq!(fetch(&sw, get("/dashboard")).await.text(), "first");
    sw.wait_idle().await;
    assert_eq!(fetch(&sw, get("/dashboard")).await.text(), "second");
  }

  #[tokio::test]
  async fn upgrade_replaces_previous_generation() {
    let storage = memory();
    let mock = Arc::new(MockFetcher::new());
    mock.route_text("/offline.html", "offline");
    mock.route_text("/js/app.js", "app");

    let v1 = worker(&storage, &mock, "v1");
    v1.dispatch(ServiceEvent::Install).await;
    v1.dispatch(ServiceEvent::Activate).await;

    let v2 = worker(&storage, &mock, "v2");
    match v2.dispatch(ServiceEvent::Install).await {
      Outcome::Installed(report) => assert_eq!(report.cached.len(), 2),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(v2.state(), WorkerState::Installed);

    let deleted = match v2.dispatch(ServiceEvent::Activate).await {
      Outcome::Activated(report) => report.deleted,
      other => panic!("unexpected {:?}", other),
    };
    assert_eq!(deleted.len(), 3);
    let names = storage.namespaces().unwrap();

    v2.dispatch(ServiceEvent::Activate).await;
    assert_eq!(storage.namespaces().unwrap(), names);
    assert!(names.iter().all(|n| n.ends_with("-v2")));
  }

  #[tokio::test]
  async fn foreign_origins_pass_through() {
    let mock = Arc::new(MockFetcher::new());
    let sw = worker(&memory(), &mock, "v1");
    let request = Request::get("https://tracker.example/pixel.gif").unwrap();
    assert!(matches!(sw.dispatch(ServiceEvent::Fetch(request)).await, Outcome::Passthrough));
    assert_eq!(mock.total_calls(), 0);
  }

  #[tokio::test]
  async fn control_messages() {
    let mock = Arc::new(MockFetcher::new());
    let sw = worker(&memory(), &mock, "v7");
    mock.route_text("/api/symbols", "[]");

    let message = ControlMessage::from_json(r#"{"type":"CACHE_URLS","payload":{"urls":["/api/symbols"]}}"#).unwrap();
    let reply = sw.dispatch(ServiceEvent::Message(message)).await;
    assert!(matches!(reply, Outcome::Reply(Reply::Cached { stored: 1 })));

    let runtime = sw.lifecycle().namespace(Purpose::Runtime).to_string();
    assert_eq!(sw.lifecycle().storage().entry_count(&runtime).unwrap(), 1);
    let clear = ControlMessage::from_json(r#"{"type":"CLEAR_CACHE"}"#).unwrap();
    assert!(matches!(sw.dispatch(ServiceEvent::Message(clear)).await, Outcome::Reply(Reply::Ack)));
    assert_eq!(sw.lifecycle().storage().entry_count(&runtime).unwrap(), 0);

    match sw.dispatch(ServiceEvent::Message(ControlMessage::GetVersion)).await {
      Outcome::Reply(Reply::Version { version, namespaces }) => {
        assert_eq!(version, "v7");
        assert!(namespaces.contains(&"lantern-static-v7".to_string()));
      }
      other => panic!("unexpected {:?}", other),
    }

    assert!(ControlMessage::from_json(r#"{"type":"REBOOT"}"#).is_err());
  }

  #[tokio::test]
  async fn skip_waiting_message_activates_installed_worker() {
    let mock = Arc::new(MockFetcher::offline());
    let sw = worker(&memory(), &mock, "v1");
    sw.dispatch(ServiceEvent::Install).await;

    let reply = sw.dispatch(ServiceEvent::Message(ControlMessage::SkipWaiting)).await;
    assert!(matches!(reply, Outcome::Reply(Reply::Ack)));
    assert_eq!(sw.state(), WorkerState::Activated);
    assert!(sw.lifecycle().is_claimed());
  }

  #[tokio::test]
  async fn sync_and_push_events() {
    let mock = Arc::new(MockFetcher::new());
    let sw = worker(&memory(), &mock, "v1");
    mock.route_text("/api/health", "ok");
    mock.route_text("/api/status", "ok");
    mock.route_text("/api/models", "[]");

    match sw.dispatch(ServiceEvent::Sync(SYNC_CRITICAL.to_string())).await {
      Outcome::Synced(report) => assert_eq!(report.refreshed.len(), 3),
      other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
      sw.dispatch(ServiceEvent::Push(b"{\"title\":\"BTC\"}".to_vec())).await,
      Outcome::Delegated
    ));
  }

  #[tokio::test]
  async fn shutdown_aborts_background_refreshes() {
    let mock = Arc::new(MockFetcher::new());
    let sw = worker(&memory(), &mock, "v1");
    mock.route_text("/", "home");
    fetch(&sw, get("/")).await;

    mock.delay("/", Duration::from_secs(3600));
    fetch(&sw, get("/")).await;
    assert_eq!(sw.engine().tasks().pending(), 1);

    sw.shutdown();
    sw.wait_idle().await;
    assert_eq!(sw.engine().tasks().pending(), 0);
  }
}
