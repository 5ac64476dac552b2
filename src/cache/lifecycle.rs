//! Versioned namespace lifecycle: install, activate and garbage collection.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{validate_for_cache, Namespace, Purpose};
use crate::error::{Error, Result};
use crate::http::{Fetcher, Request};

/// Where this generation is in its install/activate cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  /// Installed and waiting for activation
  Installed,
  Activated,
}

/// Outcome of precaching the static manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: Vec<String>,
  /// `(path, reason)` for each asset that could not be precached
  pub failed: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub deleted: Vec<String>,
}

#[derive(Debug)]
struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
  claimed: bool,
}

/// Owns the current generation's namespaces.
pub struct CacheLifecycleManager {
  storage: Arc<dyn CacheStorage>,
  origin: Url,
  version: String,
  namespaces: Vec<Namespace>,
  precache: Vec<String>,
  lifecycle: Mutex<Lifecycle>,
}

impl CacheLifecycleManager {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    origin: Url,
    prefix: &str,
    version: &str,
    precache: Vec<String>,
  ) -> Self {
    let namespaces = Purpose::ALL
      .iter()
      .map(|p| Namespace::new(prefix, *p, version))
      .collect();

    Self {
      storage,
      origin,
      version: version.to_string(),
      namespaces,
      precache,
      lifecycle: Mutex::new(Lifecycle {
        state: WorkerState::Parsed,
        skip_waiting: false,
        claimed: false,
      }),
    }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// The live namespace name for `purpose`.
  pub fn namespace(&self, purpose: Purpose) -> &str {
    self
      .namespaces
      .iter()
      .find(|ns| ns.purpose == purpose)
      .map(|ns| ns.name.as_str())
      .unwrap_or_default()
  }

  pub fn expected_names(&self) -> Vec<&str> {
    self.namespaces.iter().map(|ns| ns.name.as_str()).collect()
  }

  pub fn state(&self) -> WorkerState {
    self.with_lifecycle(|l| l.state)
  }

  pub fn is_claimed(&self) -> bool {
    self.with_lifecycle(|l| l.claimed)
  }

  fn with_lifecycle<T>(&self, f: impl FnOnce(&mut Lifecycle) -> T) -> T {
    let mut guard = match self.lifecycle.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
  }

  /// Create the current namespaces and precache the static manifest.
  ///
  /// Precaching is best-effort per asset: failures are logged and reported,
  /// the rest of the manifest is still stored.
  pub async fn install(&self, fetcher: &dyn Fetcher) -> InstallReport {
    tracing::info!(version = %self.version, "installing");

    for ns in &self.namespaces {
      if let Err(e) = self.storage.open_namespace(&ns.name) {
        tracing::error!(namespace = %ns.name, error = %e, "failed to open namespace");
      }
    }

    let static_ns = self.namespace(Purpose::Static).to_string();
    let results = join_all(self.precache.iter().map(|path| {
      let static_ns = static_ns.clone();
      async move {
        let outcome = self.precache_one(fetcher, &static_ns, path).await;
        (path.clone(), outcome)
      }
    }))
    .await;

    let mut report = InstallReport::default();
    for (path, outcome) in results {
      match outcome {
        Ok(()) => report.cached.push(path),
        Err(e) => {
          tracing::warn!(%path, error = %e, "precache failed");
          report.failed.push((path, e.to_string()));
        }
      }
    }

    let activate_now = self.with_lifecycle(|l| {
      l.state = WorkerState::Installed;
      l.skip_waiting
    });
    tracing::info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "install complete"
    );

    if activate_now {
      if let Err(e) = self.activate() {
        tracing::error!(error = %e, "activation after skip-waiting failed");
      }
    }
    report
  }

  async fn precache_one(
    &self,
    fetcher: &dyn Fetcher,
    namespace: &str,
    path: &str,
  ) -> Result<()> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| Error::InvalidRequest(format!("{}: {}", path, e)))?;
    let request = Request::new(reqwest::Method::GET, url);
    let response = fetcher.fetch(&request).await?;
    validate_for_cache(&response)?;
    self.storage.put(namespace, &request, &response)
  }

  /// Delete superseded namespaces and take control of open clients.
  ///
  /// Running it again with the same version set changes nothing.
  pub fn activate(&self) -> Result<ActivateReport> {
    tracing::info!(version = %self.version, "activating");
    let deleted = self.purge_stale()?;

    self.with_lifecycle(|l| {
      l.state = WorkerState::Activated;
      l.claimed = true;
    });
    tracing::info!(deleted = deleted.len(), "activation complete");
    Ok(ActivateReport { deleted })
  }

  /// Delete every namespace not in the current expected set.
  pub fn purge_stale(&self) -> Result<Vec<String>> {
    let expected = self.expected_names();
    let mut deleted = Vec::new();

    for name in self.storage.namespaces()? {
      if expected.contains(&name.as_str()) {
        continue;
      }
      if self.storage.delete_namespace(&name)? {
        tracing::info!(namespace = %name, "deleted stale namespace");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Request immediate activation. An installed, waiting generation is
  /// activated now; otherwise activation follows install.
  pub fn skip_waiting(&self) -> Result<Option<ActivateReport>> {
    let waiting = self.with_lifecycle(|l| {
      l.skip_waiting = true;
      l.state == WorkerState::Installed
    });

    if waiting {
      return self.activate().map(Some);
    }
    Ok(None)
  }

  /// Flush the primary (runtime) namespace.
  pub fn clear_primary(&self) -> Result<usize> {
    let name = self.namespace(Purpose::Runtime);
    let removed = self.storage.clear(name)?;
    tracing::info!(namespace = %name, removed, "cleared primary namespace");
    Ok(removed)
  }
}
