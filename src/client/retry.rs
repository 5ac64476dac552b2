//! Rate-limit and backoff aware retries.

use async_trait::async_trait;
use reqwest::header::{HeaderName, RETRY_AFTER};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::{Fetcher, Request, Response};

/// Header carrying the anti-forgery token.
pub const CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");

/// Supplies a fresh anti-forgery token before each retried attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
  async fn token(&self) -> Result<String>;
}

/// Always hands out the same token.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
  async fn token(&self) -> Result<String> {
    Ok(self.0.clone())
  }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries granted to 503 responses
  pub service_unavailable_retries: u32,
  /// Wait used when a 429 carries no usable `Retry-After`
  pub default_retry_after: Duration,
  /// Upper bound (exclusive) of the random jitter added to 429 waits
  pub max_jitter: Duration,
  /// Longest `Retry-After` honored; a 429 asking for more is returned as is
  pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      service_unavailable_retries: 3,
      default_retry_after: Duration::from_secs(1),
      max_jitter: Duration::from_millis(500),
      max_retry_after: Duration::from_secs(60),
    }
  }
}

/// Retry budget for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
  pub attempts_remaining: u32,
  pub attempts_used: u32,
}

impl RetryContext {
  pub fn new(budget: u32) -> Self {
    Self {
      attempts_remaining: budget,
      attempts_used: 0,
    }
  }

  /// `2^attempts_used` seconds.
  pub fn backoff(&self) -> Duration {
    Duration::from_secs(1u64 << self.attempts_used.min(16))
  }

  /// Take one attempt from the budget. Returns the wait before it, or
  /// `None` when the budget is spent.
  pub fn consume(&mut self) -> Option<Duration> {
    if self.attempts_remaining == 0 {
      return None;
    }
    let delay = self.backoff();
    self.attempts_remaining -= 1;
    self.attempts_used += 1;
    Some(delay)
  }
}

/// Wraps a `Fetcher` with the retry rules:
/// - 429: wait `Retry-After` plus jitter and retry exactly once, unless the
///   server asks for more than `max_retry_after`
/// - 503: exponential backoff until the budget is spent, then hand back the
///   last 503 unchanged
///
/// Other statuses and transport errors are returned as they are; timeouts are
/// never retried.
pub struct RetryPolicyExecutor {
  inner: Arc<dyn Fetcher>,
  policy: RetryPolicy,
  tokens: Option<Arc<dyn TokenProvider>>,
}

impl RetryPolicyExecutor {
  pub fn new(inner: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
    Self {
      inner,
      policy,
      tokens: None,
    }
  }

  pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
    self.tokens = Some(tokens);
    self
  }

  pub async fn execute(&self, request: &Request) -> Result<Response> {
    let response = self.inner.fetch(request).await?;
    match response.status {
      StatusCode::TOO_MANY_REQUESTS => self.retry_rate_limited(request, response).await,
      StatusCode::SERVICE_UNAVAILABLE => self.retry_unavailable(request, response).await,
      _ => Ok(response),
    }
  }

  async fn retry_rate_limited(&self, request: &Request, response: Response) -> Result<Response> {
    let retry_after = retry_after(&response).unwrap_or(self.policy.default_retry_after);
    let reason = Error::RateLimited { retry_after };
    if retry_after > self.policy.max_retry_after {
      tracing::warn!(url = %request.url, error = %reason, max = ?self.policy.max_retry_after, "retry-after too long, not retrying");
      return Ok(response);
    }
    let wait = retry_after + self.jitter();
    tracing::info!(url = %request.url, error = %reason, ?wait, "retrying once");

    tokio::time::sleep(wait).await;
    let request = self.refresh_token(request).await;
    self.inner.fetch(&request).await
  }

  async fn retry_unavailable(&self, request: &Request, mut response: Response) -> Result<Response> {
    let mut ctx = RetryContext::new(self.policy.service_unavailable_retries);

    while response.status == StatusCode::SERVICE_UNAVAILABLE {
      let Some(delay) = ctx.consume() else {
        let reason = Error::ServiceUnavailable {
          budget: ctx.attempts_remaining,
        };
        tracing::warn!(url = %request.url, error = %reason, attempts = ctx.attempts_used, "retry budget exhausted");
        break;
      };
      tracing::debug!(url = %request.url, ?delay, remaining = ctx.attempts_remaining, "backing off");

      tokio::time::sleep(delay).await;
      let retry = self.refresh_token(request).await;
      response = self.inner.fetch(&retry).await?;
    }
    Ok(response)
  }

  fn jitter(&self) -> Duration {
    let max = self.policy.max_jitter.as_millis() as u64;
    if max == 0 {
      return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..max))
  }

  /// Copy of `request` carrying a fresh token. A failed refresh keeps the
  /// previous headers.
  async fn refresh_token(&self, request: &Request) -> Request {
    let Some(tokens) = &self.tokens else {
      return request.clone();
    };
    match tokens.token().await {
      Ok(token) => request.clone().with_header(CSRF_HEADER, &token),
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "token refresh failed, retrying with old token");
        request.clone()
      }
    }
  }
}

#[async_trait]
impl Fetcher for RetryPolicyExecutor {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.execute(request).await
  }
}

/// `Retry-After` in whole seconds.
fn retry_after(response: &Response) -> Option<Duration> {
  response
    .headers
    .get(RETRY_AFTER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<u64>().ok())
    .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{get, MockFetcher};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn status(code: StatusCode, body: &str) -> Response {
    Response::new(code, body)
  }

  fn executor(mock: &Arc<MockFetcher>) -> RetryPolicyExecutor {
    RetryPolicyExecutor::new(mock.clone(), RetryPolicy::default())
  }

  #[tokio::test(start_paused = true)]
  async fn rate_limit_retries_exactly_once_after_retry_after() {
    let mock = Arc::new(MockFetcher::new());
    mock.route(
      "/api/models",
      status(StatusCode::TOO_MANY_REQUESTS, "slow down").with_header(RETRY_AFTER, "2"),
    );

    let response = executor(&mock).execute(&get("/api/models")).await.unwrap();

    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    let times = mock.call_times("/api/models");
    assert_eq!(times.len(), 2);
    let gap = times[1] - times[0];
    assert!(gap >= Duration::from_millis(2000), "gap {:?}", gap);
    assert!(gap < Duration::from_millis(2500), "gap {:?}", gap);
  }

  #[tokio::test(start_paused = true)]
  async fn rate_limit_without_header_waits_one_second() {
    let mock = Arc::new(MockFetcher::new());
    mock.enqueue("/api/symbols", status(StatusCode::TOO_MANY_REQUESTS, ""));
    mock.route_text("/api/symbols", "[]");

    let response = executor(&mock).execute(&get("/api/symbols")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let times = mock.call_times("/api/symbols");
    let gap = times[1] - times[0];
    assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1500));
  }

  #[tokio::test(start_paused = true)]
  async fn oversized_retry_after_is_not_honored() {
    for header in ["86400", "18446744073709551615"] {
      let mock = Arc::new(MockFetcher::new());
      mock.route(
        "/api/models",
        status(StatusCode::TOO_MANY_REQUESTS, "later").with_header(RETRY_AFTER, header),
      );

      let start = tokio::time::Instant::now();
      let response = executor(&mock).execute(&get("/api/models")).await.unwrap();

      assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
      assert_eq!(mock.calls("/api/models"), 1);
      assert!(start.elapsed() < Duration::from_secs(1));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn retry_after_at_the_cap_is_honored() {
    let mock = Arc::new(MockFetcher::new());
    mock.enqueue(
      "/api/models",
      status(StatusCode::TOO_MANY_REQUESTS, "").with_header(RETRY_AFTER, "60"),
    );
    mock.route_text("/api/models", "[]");

    let response = executor(&mock).execute(&get("/api/models")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(mock.calls("/api/models"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn unavailable_backs_off_exponentially_until_budget_spent() {
    let mock = Arc::new(MockFetcher::new());
    mock.route("/api/status", status(StatusCode::SERVICE_UNAVAILABLE, "down"));

    let start = tokio::time::Instant::now();
    let response = executor(&mock).execute(&get("/api/status")).await.unwrap();

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text(), "down");
    let times = mock.call_times("/api/status");
    assert_eq!(times.len(), 4);
    assert_eq!(times[1] - times[0], Duration::from_secs(1));
    assert_eq!(times[2] - times[1], Duration::from_secs(2));
    assert_eq!(times[3] - times[2], Duration::from_secs(4));
    assert!(start.elapsed() >= Duration::from_secs(7));
  }

  #[tokio::test(start_paused = true)]
  async fn unavailable_recovers_mid_budget() {
    let mock = Arc::new(MockFetcher::new());
    mock.enqueue("/api/status", status(StatusCode::SERVICE_UNAVAILABLE, ""));
    mock.route_text("/api/status", "ok");

    let response = executor(&mock).execute(&get("/api/status")).await.unwrap();
    assert_eq!(response.text(), "ok");
    assert_eq!(mock.calls("/api/status"), 2);
  }

  struct Rotating(AtomicUsize);

  #[async_trait]
  impl TokenProvider for Rotating {
    async fn token(&self) -> Result<String> {
      Ok(format!("tok-{}", self.0.fetch_add(1, Ordering::SeqCst) + 1))
    }
  }

  #[tokio::test(start_paused = true)]
  async fn retries_carry_a_refreshed_token() {
    let mock = Arc::new(MockFetcher::new());
    mock.enqueue("/api/orders", status(StatusCode::SERVICE_UNAVAILABLE, ""));
    mock.enqueue("/api/orders", status(StatusCode::SERVICE_UNAVAILABLE, ""));
    mock.route_text("/api/orders", "done");

    let exec = executor(&mock).with_tokens(Arc::new(Rotating(AtomicUsize::new(0))));
    let req = get("/api/orders").with_header(CSRF_HEADER, "tok-0");
    exec.execute(&req).await.unwrap();

    let tokens: Vec<String> = mock
      .requests("/api/orders")
      .iter()
      .map(|r| r.header("x-csrf-token").unwrap_or_default().to_string())
      .collect();
    assert_eq!(tokens, vec!["tok-0", "tok-1", "tok-2"]);
  }

  #[tokio::test]
  async fn other_statuses_and_errors_pass_through() {
    let mock = Arc::new(MockFetcher::new());
    mock.route("/api/x", status(StatusCode::INTERNAL_SERVER_ERROR, ""));
    let response = executor(&mock).execute(&get("/api/x")).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(mock.calls("/api/x"), 1);

    let offline = Arc::new(MockFetcher::offline());
    let err = executor(&offline).execute(&get("/api/x")).await.unwrap_err();
    assert!(err.is_network_failure());
    assert_eq!(offline.calls("/api/x"), 1);
  }

  #[test]
  fn context_is_bounded() {
    let mut ctx = RetryContext::new(2);
    assert_eq!(ctx.consume(), Some(Duration::from_secs(1)));
    assert_eq!(ctx.consume(), Some(Duration::from_secs(2)));
    assert_eq!(ctx.consume(), None);
    assert_eq!(ctx.attempts_used, 2);
  }
}
