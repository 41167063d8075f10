use super::*;
use crate::geoip::retriever::https_client;

use core::num::NonZeroU64;
use serde::Deserialize;
use std::time::Duration;

const UPDATE_INTERVAL_SECONDS: u64 = 86400;

/// Periodically rebuilds the index from its source and publishes the result.
///
/// A failed rebuild keeps the current index.
#[derive(Deserialize)]
#[serde(from = "GeoIpUpdaterConfig")]
pub struct GeoIpUpdater {
    interval: Duration,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl GeoIpUpdater {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    pub fn default_interval() -> Duration {
        Duration::from_secs(UPDATE_INTERVAL_SECONDS)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the update task on the current tokio runtime, returns [None] if
    /// it was already started.
    pub fn start(
        &mut self,
        source: Arc<GeoIpSource>,
        index: SharedIndex,
    ) -> Option<&tokio::task::JoinHandle<()>> {
        if self.handle.is_some() {
            return None;
        }

        let client = https_client();
        let interval = self.interval;

        self.handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let new_index = match source.clone().load_async(&client).await {
                    Ok(val) => val,
                    Err(err) => {
                        log::warn!("Error while attempting to update geo index from {source}: {err}");
                        continue;
                    }
                };
                index.publish(new_index);
                log::info!("geo index updated from {source}");
            }
        })
        .into();
        self.handle.as_ref()
    }
}

impl Default for GeoIpUpdater {
    fn default() -> Self {
        Self::new(Self::default_interval())
    }
}

impl Drop for GeoIpUpdater {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GeoIpUpdaterConfig {
    #[serde(default)]
    interval: UpdaterIntervalConfig,
}

impl From<GeoIpUpdaterConfig> for GeoIpUpdater {
    fn from(config: GeoIpUpdaterConfig) -> Self {
        Self::new(config.interval.0)
    }
}

#[derive(Deserialize)]
#[serde(from = "NonZeroU64")]
struct UpdaterIntervalConfig(Duration);

impl Default for UpdaterIntervalConfig {
    fn default() -> Self {
        Self(GeoIpUpdater::default_interval())
    }
}

impl From<NonZeroU64> for UpdaterIntervalConfig {
    fn from(value: NonZeroU64) -> Self {
        Self(Duration::from_secs(value.get()))
    }
}
