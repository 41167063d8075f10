use super::*;
use crate::geoip::archive::ArchiveFormat;
use crate::geoip::error::ConfigError;
use crate::geoip::retriever::{Retriever, MAXMIND_URL_PREFIX};
use crate::geoip::updater::GeoIpUpdater;

use core::num::{NonZeroU32, NonZeroU64};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const LICENSE_KEY_ENV: &str = "MAXMIND_LICENSE_KEY";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeoIpConfig {
    /// Already unpacked dataset, nothing is downloaded when set
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    license_key: Option<String>,
    #[serde(default = "GeoIpConfig::default_locale")]
    locale: String,
    #[serde(default)]
    archive: ArchiveFormat,
    #[serde(default)]
    staging_dir: Option<PathBuf>,
    #[serde(default)]
    download: DownloadConfig,
    #[serde(default)]
    autoupdate: GeoIpAutoupdateConfig,
}

impl GeoIpConfig {
    fn default_locale() -> String {
        "en".into()
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            license_key: None,
            locale: Self::default_locale(),
            archive: ArchiveFormat::default(),
            staging_dir: None,
            download: DownloadConfig::default(),
            autoupdate: GeoIpAutoupdateConfig::default(),
        }
    }

    pub fn source(&self) -> Result<GeoIpSource, GeoIpError> {
        let locale = self.locale.clone();
        match &self.path {
            Some(path) => Ok(GeoIpSource::Folder {
                path: path.clone(),
                locale,
            }),
            None => {
                let license_key = resolve_license_key(
                    self.license_key.as_deref(),
                    std::env::var(LICENSE_KEY_ENV).ok(),
                )?;
                let staging_root = self
                    .staging_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                let retriever = Retriever::new(
                    &self.download.url_prefix,
                    &license_key,
                    self.archive,
                    staging_root,
                )?
                .with_policy(
                    self.download.timeout.0,
                    self.download.attempts,
                    self.download.backoff.0,
                );
                Ok(GeoIpSource::Download { retriever, locale })
            }
        }
    }

    pub fn into_updater(self) -> Option<GeoIpUpdater> {
        self.autoupdate.into_updater()
    }
}

/// Configured key wins over the environment
fn resolve_license_key(
    configured: Option<&str>,
    environment: Option<String>,
) -> Result<String, ConfigError> {
    let key = match configured {
        Some(key) => key.to_owned(),
        None => environment.ok_or(ConfigError::MissingLicenseKey)?,
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::MissingLicenseKey);
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::InvalidLicenseKey);
    }
    Ok(key.to_owned())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadConfig {
    #[serde(default = "DownloadConfig::default_url_prefix")]
    url_prefix: String,
    #[serde(default = "DownloadConfig::default_timeout")]
    timeout: NonZeroSeconds,
    #[serde(default = "DownloadConfig::default_attempts")]
    attempts: NonZeroU32,
    #[serde(default = "DownloadConfig::default_backoff")]
    backoff: NonZeroSeconds,
}

impl DownloadConfig {
    fn default_url_prefix() -> String {
        MAXMIND_URL_PREFIX.into()
    }

    fn default_timeout() -> NonZeroSeconds {
        NonZeroSeconds(Duration::from_secs(60))
    }

    fn default_attempts() -> NonZeroU32 {
        NonZeroU32::new(3).unwrap_or(NonZeroU32::MIN)
    }

    fn default_backoff() -> NonZeroSeconds {
        NonZeroSeconds(Duration::from_secs(2))
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url_prefix: Self::default_url_prefix(),
            timeout: Self::default_timeout(),
            attempts: Self::default_attempts(),
            backoff: Self::default_backoff(),
        }
    }
}

#[derive(Deserialize)]
#[serde(from = "NonZeroU64")]
pub(crate) struct NonZeroSeconds(pub(crate) Duration);

impl From<NonZeroU64> for NonZeroSeconds {
    fn from(value: NonZeroU64) -> Self {
        Self(Duration::from_secs(value.get()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeoIpAutoupdateConfig {
    Boolean(bool),
    Updater(GeoIpUpdater),
}

impl Default for GeoIpAutoupdateConfig {
    fn default() -> Self {
        Self::Boolean(false)
    }
}

impl GeoIpAutoupdateConfig {
    fn into_updater(self) -> Option<GeoIpUpdater> {
        match self {
            Self::Boolean(false) => None,
            Self::Boolean(true) => Some(GeoIpUpdater::default()),
            Self::Updater(updater) => Some(updater),
        }
    }
}
