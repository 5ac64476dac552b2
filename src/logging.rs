//! Subscriber setup for the binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "lantern=info";

fn filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: stderr always, plus a daily rolling file in
/// `log_dir` when given. Keep the returned guard alive until exit so buffered
/// file output is flushed.
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let stderr = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .with_filter(filter());

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "lantern.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  if tracing_subscriber::registry()
    .with(stderr)
    .with(file_layer)
    .try_init()
    .is_err()
  {
    tracing::debug!("tracing subscriber already installed");
  }

  if let Some(dir) = log_dir {
    tracing::debug!(dir = %dir.display(), "logging to file");
  }
  guard
}
