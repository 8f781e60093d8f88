//! Sets up the lease cache and its reporting from a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::lease_cache::{LeaseCache, LeaseCacheConfig};
use crate::logging;
use crate::metrics;
use crate::persist::PersistentStorage;
use crate::proxy::Proxier;
use crate::renewer::HttpRenewClient;

/// Initializes error reporting, logging and metrics.
///
/// The returned guard flushes pending Sentry events when dropped, so it should be held until
/// the agent exits. Failing to configure metrics is logged, but not fatal.
///
/// # Safety
/// This calls [`logging::init_logging`], and has the same requirements: it may only be called
/// while the process is single-threaded.
pub unsafe fn init_reporting(config: &Config) -> sentry::ClientInitGuard {
    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        auto_session_tracking: false,
        ..Default::default()
    });

    // SAFETY: Passed on to the caller.
    unsafe { logging::init_logging(config) };

    if let Err(err) = metrics::init_metrics(&config.metrics) {
        let err = anyhow::Error::new(err).context("failed to configure metrics");
        logging::ensure_log_error(&err);
    }

    sentry
}

/// Creates the lease cache described by `config`.
///
/// Renewals go to the configured remote server. If persistence is configured, the storage is
/// opened and everything persisted in it is restored before the cache is returned. All
/// renewals run below `base`.
pub async fn create_lease_cache(
    config: &Config,
    proxier: Arc<dyn Proxier>,
    base: CancellationToken,
) -> Result<LeaseCache> {
    let client =
        HttpRenewClient::new(&config.remote).context("failed to create the renewal client")?;

    let storage = match config.persist.clone() {
        Some(persist) => {
            let storage = tokio::task::spawn_blocking(move || PersistentStorage::open(&persist))
                .await
                .context("failed to open the persistent storage")?
                .context("failed to open the persistent storage")?;
            Some(Arc::new(storage))
        }
        None => None,
    };

    let cache = LeaseCache::new(LeaseCacheConfig {
        proxier,
        client: Arc::new(client),
        storage: storage.clone(),
        renewal: config.renewal,
        base,
    });

    if let (Some(storage), Some(persist)) = (storage, &config.persist) {
        cache
            .restore(storage, persist.exit_on_err)
            .await
            .context("failed to restore the lease cache")?;
    }

    Ok(cache)
}
