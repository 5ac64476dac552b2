//! Registry for detached background work (stale-while-revalidate refreshes).

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Tracks spawned background tasks so callers can await or abort them.
#[derive(Clone, Default)]
pub struct TaskRegistry {
  handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, label: impl Into<String>, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let label = label.into();
    let handle = tokio::spawn(task);
    let mut handles = self.lock();
    handles.retain(|(_, h)| !h.is_finished());
    tracing::trace!(task = %label, in_flight = handles.len() + 1, "spawned background task");
    handles.push((label, handle));
  }

  /// Number of tasks that have not finished yet.
  pub fn pending(&self) -> usize {
    self.lock().iter().filter(|(_, h)| !h.is_finished()).count()
  }

  /// Wait until every registered task, including ones spawned while
  /// waiting, has finished.
  pub async fn wait_idle(&self) {
    loop {
      let batch: Vec<_> = self.lock().drain(..).collect();
      if batch.is_empty() {
        return;
      }
      for (label, handle) in batch {
        if let Err(e) = handle.await {
          if !e.is_cancelled() {
            tracing::warn!(task = %label, error = %e, "background task panicked");
          }
        }
      }
    }
  }

  pub fn abort_all(&self) {
    for (_, handle) in self.lock().drain(..) {
      handle.abort();
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
    match self.handles.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}
