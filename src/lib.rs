//! Offline-first resilience layer for a web client.
//!
//! Intercepted requests are classified and routed through a caching strategy
//! (`cache`), sent over a throttled and retrying client (`client`), and
//! answered from a synthesized fallback (`offline`) when neither cache nor
//! network can. `store` keeps structured records across sessions and `sync`
//! refreshes critical data when connectivity returns. `service` dispatches
//! lifecycle, fetch, message and sync events to all of the above.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod offline;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
