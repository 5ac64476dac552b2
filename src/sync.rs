//! Background sync: stale namespace purge, critical endpoint refresh and
//! offline queue replay.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheLifecycleManager, CacheStrategyEngine};
use crate::http::Fetcher;
use crate::queue::ReplayReport;

/// Fired when connectivity returns.
pub const SYNC_CRITICAL: &str = "sync-critical";
/// Fired to flush mutations queued while offline.
pub const SYNC_OFFLINE_REQUESTS: &str = "sync-offline-requests";
/// Periodic refresh of the critical endpoints.
pub const PERIODIC_CRITICAL_REFRESH: &str = "critical-refresh";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub tag: String,
  /// Stale namespaces deleted before the refresh
  pub purged: Vec<String>,
  pub refreshed: Vec<String>,
  /// `(path, reason)` for endpoints that could not be refreshed
  pub failed: Vec<(String, String)>,
  pub replay: Option<ReplayReport>,
  /// The tag is not one this coordinator handles
  pub ignored: bool,
}

impl SyncReport {
  fn new(tag: &str) -> Self {
    Self {
      tag: tag.to_string(),
      ..Self::default()
    }
  }
}

#[derive(Clone)]
pub struct BackgroundSyncCoordinator {
  lifecycle: Arc<CacheLifecycleManager>,
  engine: CacheStrategyEngine,
  fetcher: Arc<dyn Fetcher>,
  critical: Vec<String>,
}

impl BackgroundSyncCoordinator {
  pub fn new(
    lifecycle: Arc<CacheLifecycleManager>,
    engine: CacheStrategyEngine,
    fetcher: Arc<dyn Fetcher>,
    critical: Vec<String>,
  ) -> Self {
    Self {
      lifecycle,
      engine,
      fetcher,
      critical,
    }
  }

  pub fn critical_endpoints(&self) -> &[String] {
    &self.critical
  }

  pub async fn on_sync(&self, tag: &str) -> SyncReport {
    let mut report = SyncReport::new(tag);
    match tag {
      SYNC_CRITICAL => {
        match self.lifecycle.purge_stale() {
          Ok(purged) => report.purged = purged,
          Err(e) => tracing::warn!(error = %e, "purge before sync failed"),
        }
        self.refresh_critical(&mut report).await;
      }
      SYNC_OFFLINE_REQUESTS => {
        let replay = self.engine.queue().replay(self.fetcher.as_ref()).await;
        tracing::info!(
          sent = replay.sent,
          requeued = replay.requeued,
          dropped = replay.dropped,
          "replayed offline queue"
        );
        report.replay = Some(replay);
      }
      _ => {
        tracing::debug!(%tag, "ignoring sync tag");
        report.ignored = true;
      }
    }
    report
  }

  pub async fn on_periodic(&self, tag: &str) -> SyncReport {
    let mut report = SyncReport::new(tag);
    if tag == PERIODIC_CRITICAL_REFRESH {
      self.refresh_critical(&mut report).await;
    } else {
      tracing::debug!(%tag, "ignoring periodic sync tag");
      report.ignored = true;
    }
    report
  }

  /// Refresh every critical endpoint concurrently. One failure never stops
  /// the others.
  async fn refresh_critical(&self, report: &mut SyncReport) {
    let results = join_all(self.critical.iter().map(|path| self.engine.cache_url(path))).await;

    for (path, result) in self.critical.iter().zip(results) {
      match result {
        Ok(true) => report.refreshed.push(path.clone()),
        Ok(false) => report
          .failed
          .push((path.clone(), "response not cacheable".to_string())),
        Err(e) => {
          tracing::warn!(%path, error = %e, "critical refresh failed");
          report.failed.push((path.clone(), e.to_string()));
        }
      }
    }
    tracing::info!(
      tag = %report.tag,
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "critical refresh complete"
    );
  }

  /// Run `on_periodic(critical-refresh)` every `interval` until the handle is
  /// shut down. The first run happens one interval after spawning.
  pub fn spawn_periodic(&self, interval: Duration) -> PeriodicHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let coordinator = self.clone();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            coordinator.on_periodic(PERIODIC_CRITICAL_REFRESH).await;
          }
          _ = shutdown_rx.recv() => break,
        }
      }
      tracing::debug!("periodic sync stopped");
    });

    PeriodicHandle { shutdown_tx, task }
  }
}

/// Controls a periodic sync loop.
pub struct PeriodicHandle {
  shutdown_tx: mpsc::Sender<()>,
  task: JoinHandle<()>,
}

impl PeriodicHandle {
  /// Stop the loop and wait for it to exit.
  pub async fn shutdown(self) {
    let _ = self.shutdown_tx.send(()).await;
    if let Err(e) = self.task.await {
      tracing::warn!(error = %e, "periodic sync task ended abnormally");
    }
  }
}
