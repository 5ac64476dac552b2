//! Scripted network double used by unit tests.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::http::{Fetcher, Request, Response};

pub const ORIGIN: &str = "https://app.test";

pub fn url(path: &str) -> String {
  format!("{}{}", ORIGIN, path)
}

pub fn get(path: &str) -> Request {
  Request::get(&url(path)).unwrap()
}

/// Replies are looked up by URL path: queued one-shot replies first, then the
/// standing route, then 404.
#[derive(Default)]
pub struct MockFetcher {
  offline: AtomicBool,
  routes: Mutex<HashMap<String, Response>>,
  queued: Mutex<HashMap<String, VecDeque<Response>>>,
  delays: Mutex<HashMap<String, Duration>>,
  log: Mutex<Vec<(Request, Instant)>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every request fails with `NetworkUnavailable`.
  pub fn offline() -> Self {
    let mock = Self::default();
    mock.set_offline(true);
    mock
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn route(&self, path: &str, response: Response) {
    self.routes.lock().unwrap().insert(path.to_string(), response);
  }

  pub fn route_text(&self, path: &str, body: &str) {
    self.route(path, Response::new(StatusCode::OK, body));
  }

  pub fn enqueue(&self, path: &str, response: Response) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn delay(&self, path: &str, delay: Duration) {
    self.delays.lock().unwrap().insert(path.to_string(), delay);
  }

  pub fn calls(&self, path: &str) -> usize {
    self.requests(path).len()
  }

  pub fn total_calls(&self) -> usize {
    self.log.lock().unwrap().len()
  }

  pub fn requests(&self, path: &str) -> Vec<Request> {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|(r, _)| r.path() == path)
      .map(|(r, _)| r.clone())
      .collect()
  }

  pub fn call_times(&self, path: &str) -> Vec<Instant> {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|(r, _)| r.path() == path)
      .map(|(_, t)| *t)
      .collect()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.path().to_string();
    self
      .log
      .lock()
      .unwrap()
      .push((request.clone(), Instant::now()));

    let delay = self.delays.lock().unwrap().get(&path).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(Error::NetworkUnavailable("mock offline".to_string()));
    }

    let queued = self
      .queued
      .lock()
      .unwrap()
      .get_mut(&path)
      .and_then(|q| q.pop_front());
    if let Some(response) = queued {
      return Ok(response);
    }

    let routed = self.routes.lock().unwrap().get(&path).cloned();
    Ok(routed.unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "not found")))
  }
}
