//! Response caching for intercepted requests.
//!
//! This module provides:
//! - Request classification against static route lists (`classify`)
//! - Per-class strategies: cache-first, network-first, stale-while-revalidate
//!   and network-only (`engine`)
//! - Versioned namespaces with install/activate garbage collection (`lifecycle`)
//! - SQLite-backed namespace storage shared by every context (`storage`)

pub mod classify;
pub mod engine;
pub mod lifecycle;
pub mod storage;
pub mod tasks;
mod traits;

pub use classify::{Classifier, RequestClass};
pub use engine::{CacheStrategyEngine, EntryLimits};
pub use lifecycle::{ActivateReport, CacheLifecycleManager, InstallReport, WorkerState};
pub use storage::{CacheStorage, SqliteStorage};
pub use tasks::TaskRegistry;
pub use traits::{request_key, validate_for_cache, CachedResponse, Namespace, Purpose};
