//! Strategy engine that routes each request through its caching strategy.

use futures::future::join_all;
use reqwest::StatusCode;
use std::sync::Arc;

use super::classify::{Classifier, RequestClass};
use super::lifecycle::CacheLifecycleManager;
use super::tasks::TaskRegistry;
use super::traits::{validate_for_cache, Purpose};
use crate::error::{Error, Result};
use crate::http::{Fetcher, Request, Response};
use crate::offline::{OfflineFallbackProvider, OFFLINE_PAGE_PATH};
use crate::queue::OfflineQueue;

/// Per-namespace entry ceilings applied after runtime writes.
#[derive(Debug, Clone, Copy)]
pub struct EntryLimits {
  pub runtime: usize,
  pub image: usize,
}

impl Default for EntryLimits {
  fn default() -> Self {
    Self {
      runtime: 50,
      image: 30,
    }
  }
}

/// Central dispatcher for intercepted requests.
///
/// `handle` always resolves to a response: network and cache failures end
/// in the offline fallback instead of an error.
#[derive(Clone)]
pub struct CacheStrategyEngine {
  lifecycle: Arc<CacheLifecycleManager>,
  classifier: Classifier,
  fallback: OfflineFallbackProvider,
  fetcher: Arc<dyn Fetcher>,
  limits: EntryLimits,
  tasks: TaskRegistry,
  queue: OfflineQueue,
}

impl CacheStrategyEngine {
  pub fn new(
    lifecycle: Arc<CacheLifecycleManager>,
    classifier: Classifier,
    fallback: OfflineFallbackProvider,
    fetcher: Arc<dyn Fetcher>,
  ) -> Self {
    Self {
      lifecycle,
      classifier,
      fallback,
      fetcher,
      limits: EntryLimits::default(),
      tasks: TaskRegistry::new(),
      queue: OfflineQueue::new(),
    }
  }

  pub fn with_limits(mut self, limits: EntryLimits) -> Self {
    self.limits = limits;
    self
  }

  pub fn tasks(&self) -> &TaskRegistry {
    &self.tasks
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn classifier(&self) -> &Classifier {
    &self.classifier
  }

  /// Whether the request is handled here at all (same-origin gating).
  pub fn intercepts(&self, request: &Request) -> bool {
    self.classifier.intercepts(request)
  }

  pub async fn handle(&self, request: Request) -> Response {
    let class = self.classifier.classify(&request);
    tracing::debug!(method = %request.method, url = %request.url, ?class, "handling request");

    match class {
      RequestClass::Sensitive => self.network_only(&request, false).await,
      RequestClass::StaticAsset => self.cache_first(&request).await,
      RequestClass::Api => {
        let cacheable = self.classifier.is_cacheable_api(request.path());
        self.network_first(&request, cacheable).await
      }
      RequestClass::Navigation => self.stale_while_revalidate(request).await,
      RequestClass::Passthrough if request.is_get() && self.classifier.is_same_origin(&request.url) => {
        self.network_first(&request, true).await
      }
      RequestClass::Passthrough => self.network_only(&request, true).await,
    }
  }

  /// Network only, nothing is written to any namespace.
  async fn network_only(&self, request: &Request, queue_mutations: bool) -> Response {
    match self.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        let queueable = queue_mutations
          && !request.is_get()
          && self.classifier.is_same_origin(&request.url);
        if queueable {
          self.queue.push(request.clone());
          return Response::synthetic(
            StatusCode::ACCEPTED,
            "application/json",
            r#"{"queued":true,"message":"Request queued for background sync"}"#,
          );
        }
        tracing::debug!(url = %request.url, error = %e, "network-only request failed");
        self.offline(request)
      }
    }
  }

  /// Cache lookup first; network on miss, storing validated responses.
  async fn cache_first(&self, request: &Request) -> Response {
    let purpose = self.classifier.asset_purpose(request);
    let purposes: &[Purpose] = match purpose {
      Purpose::Static => &[Purpose::Static],
      _ => &[purpose, Purpose::Static],
    };
    if let Some(hit) = self.lookup(request, purposes) {
      return hit;
    }

    match self.fetch(request).await {
      Ok(response) => {
        self.store(purpose, request, &response);
        response
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "asset unavailable");
        self.offline(request)
      }
    }
  }

  /// Network first; cached copy only when the network leg fails. Responses
  /// are written to the runtime namespace when `cache` is set.
  async fn network_first(&self, request: &Request, cache: bool) -> Response {
    match self.fetch(request).await {
      Ok(response) => {
        if cache {
          self.store(Purpose::Runtime, request, &response);
        }
        response
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "network failed, trying cache");
        self
          .lookup(request, &[Purpose::Runtime])
          .unwrap_or_else(|| self.offline(request))
      }
    }
  }

  /// Cached copy immediately with a tracked background refresh; await the
  /// network only on a miss.
  async fn stale_while_revalidate(&self, request: Request) -> Response {
    if let Some(hit) = self.lookup(&request, &[Purpose::Runtime, Purpose::Static]) {
      let engine = self.clone();
      let label = format!("revalidate {}", request.url);
      self.tasks.spawn(label, async move {
        engine.revalidate(&request).await;
      });
      return hit;
    }

    match self.fetch(&request).await {
      Ok(response) => {
        self.store(Purpose::Runtime, &request, &response);
        response
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "navigation failed with empty cache");
        self.offline(&request)
      }
    }
  }

  async fn revalidate(&self, request: &Request) {
    match self.fetch(request).await {
      Ok(response) => {
        self.store(Purpose::Runtime, request, &response);
      }
      Err(e) => tracing::debug!(url = %request.url, error = %e, "background revalidation failed"),
    }
  }

  /// Fetch `urls` into the runtime namespace concurrently. Returns how many
  /// entries were stored.
  pub async fn cache_urls(&self, urls: &[String]) -> usize {
    let results = join_all(urls.iter().map(|raw| self.cache_url(raw))).await;
    results
      .into_iter()
      .zip(urls)
      .filter(|(result, raw)| match result {
        Ok(stored) => *stored,
        Err(e) => {
          tracing::warn!(url = %raw, error = %e, "failed to cache url");
          false
        }
      })
      .count()
  }

  /// Fetch one same-origin, non-sensitive GET into the runtime namespace.
  /// `Ok(false)` means the response came back but was not cacheable.
  pub async fn cache_url(&self, raw: &str) -> Result<bool> {
    let request = self.resolve(raw)?;
    if !self.classifier.is_same_origin(&request.url) {
      return Err(Error::InvalidRequest(format!("{} is cross-origin", raw)));
    }
    if self.classifier.is_sensitive(request.path()) {
      return Err(Error::InvalidRequest(format!("{} is sensitive", raw)));
    }

    let response = self.fetch(&request).await?;
    Ok(self.store(Purpose::Runtime, &request, &response))
  }

  /// Last resort: the precached offline page for documents, otherwise a
  /// synthesized fallback.
  fn offline(&self, request: &Request) -> Response {
    if request.accepts_html() {
      let page = self
        .resolve(OFFLINE_PAGE_PATH)
        .ok()
        .and_then(|page| self.lookup(&page, &[Purpose::Static]));
      if let Some(page) = page {
        tracing::debug!(url = %request.url, "serving precached offline page");
        return page;
      }
    }
    self.fallback.respond(request)
  }

  fn resolve(&self, raw: &str) -> Result<Request> {
    let url = self
      .lifecycle
      .origin()
      .join(raw)
      .map_err(|e| Error::InvalidRequest(format!("{}: {}", raw, e)))?;
    Ok(Request::new(reqwest::Method::GET, url))
  }

  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.fetcher.fetch(request).await
  }

  /// First matching entry across the namespaces for `purposes`. Storage
  /// errors count as a miss.
  fn lookup(&self, request: &Request, purposes: &[Purpose]) -> Option<Response> {
    let storage = self.lifecycle.storage();
    for purpose in purposes {
      let namespace = self.lifecycle.namespace(*purpose);
      match storage.match_request(namespace, request) {
        Ok(Some(hit)) => {
          tracing::trace!(url = %request.url, %namespace, "cache hit");
          return Some(hit.to_response());
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(url = %request.url, %namespace, error = %e, "cache lookup failed"),
      }
    }
    None
  }

  /// Validate and write a response, then apply the namespace ceiling.
  /// Returns whether the entry was written.
  fn store(&self, purpose: Purpose, request: &Request, response: &Response) -> bool {
    if self.classifier.is_sensitive(request.path()) {
      tracing::error!(url = %request.url, "refusing to cache sensitive response");
      return false;
    }
    if let Err(e) = validate_for_cache(response) {
      tracing::trace!(url = %request.url, error = %e, "not caching");
      return false;
    }

    let namespace = self.lifecycle.namespace(purpose);
    let storage = self.lifecycle.storage();
    if let Err(e) = storage.put(namespace, request, response) {
      tracing::warn!(url = %request.url, %namespace, error = %e, "cache write failed");
      return false;
    }

    let ceiling = match purpose {
      Purpose::Runtime => Some(self.limits.runtime),
      Purpose::Image => Some(self.limits.image),
      Purpose::Static => None,
    };
    if let Some(max) = ceiling {
      match storage.trim(namespace, max) {
        Ok(0) => {}
        Ok(removed) => tracing::debug!(%namespace, removed, "trimmed namespace"),
        Err(e) => tracing::warn!(%namespace, error = %e, "trim failed"),
      }
    }
    true
  }
}
