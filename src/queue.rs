//! Offline queue for mutations that could not reach the network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::http::{Fetcher, Request};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
  pub sent: usize,
  /// Failed again and put back on the queue
  pub requeued: usize,
  /// Rejected by the origin with a client error and dropped
  pub dropped: usize,
}

/// FIFO of queued mutations, replayed on the `sync-offline-requests` tag.
#[derive(Clone, Default)]
pub struct OfflineQueue {
  inner: Arc<Mutex<VecDeque<Request>>>,
}

impl OfflineQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, request: Request) {
    tracing::info!(method = %request.method, url = %request.url, "queued request for background sync");
    self.lock().push_back(request);
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Send every queued request in order. Network failures and server errors
  /// go back on the queue; client errors are dropped.
  pub async fn replay(&self, fetcher: &dyn Fetcher) -> ReplayReport {
    let batch: Vec<Request> = self.lock().drain(..).collect();
    let mut report = ReplayReport::default();
    let mut retry = Vec::new();

    for request in batch {
      match fetcher.fetch(&request).await {
        Ok(response) if response.status.is_success() => report.sent += 1,
        Ok(response) if response.status.is_client_error() => {
          tracing::warn!(url = %request.url, status = %response.status, "dropping rejected queued request");
          report.dropped += 1;
        }
        Ok(response) => {
          tracing::debug!(url = %request.url, status = %response.status, "queued request failed, re-queueing");
          retry.push(request);
        }
        Err(e) => {
          tracing::debug!(url = %request.url, error = %e, "queued request failed, re-queueing");
          retry.push(request);
        }
      }
    }

    report.requeued = retry.len();
    let mut queue = self.lock();
    for request in retry.into_iter().rev() {
      queue.push_front(request);
    }
    report
  }

  fn lock(&self) -> MutexGuard<'_, VecDeque<Request>> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}
