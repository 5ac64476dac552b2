//! Concurrency bound for outbound requests.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::http::{Fetcher, Request, Response};

/// A held unit of request capacity. Dropping it releases the slot.
#[derive(Debug)]
pub struct ThrottleTicket {
  _permit: OwnedSemaphorePermit,
}

/// Counts one queued waiter for as long as it lives.
struct WaitingGuard(Arc<AtomicUsize>);

impl WaitingGuard {
  fn enter(counter: &Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter.clone())
  }
}

impl Drop for WaitingGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Bounds in-flight requests to `max_concurrent`.
///
/// Waiters are admitted strictly in the order they queued (tokio's
/// semaphore is fair). Completion order is unconstrained.
#[derive(Debug, Clone)]
pub struct RequestThrottler {
  semaphore: Arc<Semaphore>,
  max_concurrent: usize,
  waiting: Arc<AtomicUsize>,
}

impl RequestThrottler {
  pub fn new(max_concurrent: usize) -> Self {
    let max_concurrent = max_concurrent.max(1);
    Self {
      semaphore: Arc::new(Semaphore::new(max_concurrent)),
      max_concurrent,
      waiting: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_concurrent
  }

  pub fn in_flight(&self) -> usize {
    self.max_concurrent - self.semaphore.available_permits()
  }

  pub fn waiting(&self) -> usize {
    self.waiting.load(Ordering::SeqCst)
  }

  /// Wait for a ticket in FIFO order. Dropping the future gives up the
  /// place in line.
  pub async fn acquire(&self) -> Result<ThrottleTicket> {
    let waiting = WaitingGuard::enter(&self.waiting);
    let permit = self.semaphore.clone().acquire_owned().await;
    drop(waiting);

    let permit = permit.map_err(|_| Error::NetworkUnavailable("throttler closed".to_string()))?;
    Ok(ThrottleTicket { _permit: permit })
  }

  /// Run `task` while holding a ticket. The ticket is released when `task`
  /// finishes, fails or is cancelled.
  pub async fn run<F, Fut, T>(&self, task: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let _ticket = self.acquire().await?;
    Ok(task().await)
  }
}

/// A `Fetcher` that takes one ticket per attempt.
pub struct ThrottledFetcher {
  inner: Arc<dyn Fetcher>,
  throttler: RequestThrottler,
}

impl ThrottledFetcher {
  pub fn new(inner: Arc<dyn Fetcher>, throttler: RequestThrottler) -> Self {
    Self { inner, throttler }
  }

  pub fn throttler(&self) -> &RequestThrottler {
    &self.throttler
  }
}

#[async_trait]
impl Fetcher for ThrottledFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let _ticket = self.throttler.acquire().await?;
    tracing::trace!(
      url = %request.url,
      in_flight = self.throttler.in_flight(),
      "ticket acquired"
    );
    self.inner.fetch(request).await
  }
}
