//! A caching layer for an agent that proxies requests to a secrets server.
//!
//! The [`LeaseCache`] answers repeated requests for tokens and leased secrets from memory,
//! keeps cached secrets alive by renewing them in the background, and evicts them once they
//! expire, get revoked, or are cleared through the [cache clear
//! endpoint](LeaseCache::handle_cache_clear). Entries can be persisted to a
//! [`PersistentStorage`] and restored after a restart.

#[macro_use]
pub mod metrics;

pub mod api;
pub mod cachememdb;
pub mod config;
pub mod error;
pub mod keys;
pub mod lease_cache;
pub mod logging;
pub mod persist;
pub mod proxy;
pub mod renewer;
pub mod service;

pub use error::LeaseCacheError;
pub use lease_cache::{CacheClearRequest, ClearTarget, LeaseCache, LeaseCacheConfig};
pub use persist::PersistentStorage;
pub use proxy::{Proxier, SendRequest, SendResponse};
pub use renewer::{HttpRenewClient, RenewClient};
