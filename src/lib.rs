//! In order to let an integration test drive the whole agent without
//! spawning a subprocess, startup is exposed as a function here instead of
//! living directly in `main.rs`.

pub mod config;
pub mod error;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cache::ResourceCache;
use engine::Reconciler;
use mapgate::AyaMapGateway;

pub use config::Config;
pub use error::StartupError;
pub use watch::WatchDriver;

/// Wires the cache, the pinned map, the reconciliation engine and the
/// cluster watch driver together, then runs until the watch driver exits
/// (normally only on an unrecoverable transport error or process signal).
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let map = AyaMapGateway::open(&config.maps.endpoints_to_service_path).map_err(|err| {
        StartupError::MapUnavailable(format!(
            "{}: {err}",
            config.maps.endpoints_to_service_path.display()
        ))
    })?;

    let cache = Arc::new(ResourceCache::new());
    let reconciler = Arc::new(Reconciler::new(cache.clone(), Arc::new(map)));

    let driver = WatchDriver::connect(config.kubeconfig.as_deref())
        .await
        .map_err(|err| StartupError::Config(err.to_string()))?;

    let status_handle = tokio::spawn(status_task(
        cache,
        Duration::from_secs(config.watch.status_interval_secs),
    ));

    let resync_period = Duration::from_secs(config.watch.resync_period_secs);

    tokio::select! {
        res = driver.run(reconciler, resync_period) => {
            res.context("watch driver exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal, stopping");
        }
    }

    status_handle.abort();
    Ok(())
}

/// Non-core: periodically logs how many Services and Endpoints objects are
/// currently cached, outside the Reconciler's write lock.
async fn status_task(cache: Arc<ResourceCache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        log::info!(
            "cache status: {} services, {} endpoints",
            cache.services_len(),
            cache.endpoints_len(),
        );
    }
}
