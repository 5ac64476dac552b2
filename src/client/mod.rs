//! Outbound request pipeline.
//!
//! Requests leave through a retry layer (`retry`) sitting on a concurrency
//! bound (`throttle`) sitting on a per-attempt timeout and the transport.
//! Each retried attempt takes its own throttle ticket and its own timeout, so
//! backoff waits neither hold a slot nor count against the timeout.

pub mod retry;
pub mod throttle;

pub use retry::{
  RetryContext, RetryPolicy, RetryPolicyExecutor, StaticTokenProvider, TokenProvider, CSRF_HEADER,
};
pub use throttle::{RequestThrottler, ThrottleTicket, ThrottledFetcher};

use std::sync::Arc;

use crate::config::Config;
use crate::http::{Fetcher, TimeoutFetcher};

/// Layered client: retry over throttle over timeout over `transport`.
pub struct ClientStack {
  pub fetcher: Arc<dyn Fetcher>,
  pub throttler: RequestThrottler,
}

impl ClientStack {
  pub fn new(transport: Arc<dyn Fetcher>, config: &Config) -> Self {
    let throttler = RequestThrottler::new(config.max_concurrent);
    let timed: Arc<dyn Fetcher> = Arc::new(TimeoutFetcher::new(transport, config.network_timeout()));
    let throttled: Arc<dyn Fetcher> = Arc::new(ThrottledFetcher::new(timed, throttler.clone()));

    let policy = RetryPolicy {
      service_unavailable_retries: config.service_unavailable_retries,
      ..RetryPolicy::default()
    };
    let mut executor = RetryPolicyExecutor::new(throttled, policy);
    if let Some(token) = Config::csrf_token() {
      executor = executor.with_tokens(Arc::new(StaticTokenProvider(token)));
    }

    Self {
      fetcher: Arc::new(executor),
      throttler,
    }
  }
}
