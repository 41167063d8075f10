use crate::geoip::{ConfigError, GeoIpConfig};

use core::num::NonZeroUsize;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "Config::default_host")]
    pub host: SocketAddr,
    #[serde(default = "Config::default_log_level")]
    pub log_level: log::Level,
    #[serde(default)]
    pub threads: ConfigThreads,
    #[serde(default = "Config::default_max_body_size")]
    pub max_body_size: usize,
    pub geoip: GeoIpConfig,
}

impl Config {
    fn default_host() -> SocketAddr {
        ([127, 0, 0, 1], 3000).into()
    }

    fn default_log_level() -> log::Level {
        log::Level::Info
    }

    fn default_max_body_size() -> usize {
        64 * 1024
    }
}

/// Number of tokio worker threads, only used with the multi-thread feature
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConfigThreadsDe")]
pub enum ConfigThreads {
    #[default]
    Cores,
    Custom(NonZeroUsize),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigThreadsDe {
    Number(NonZeroUsize),
    Name(String),
}

impl TryFrom<ConfigThreadsDe> for ConfigThreads {
    type Error = ConfigError;

    fn try_from(value: ConfigThreadsDe) -> Result<Self, Self::Error> {
        match value {
            ConfigThreadsDe::Number(threads) => Ok(Self::Custom(threads)),
            ConfigThreadsDe::Name(name) if name == "cores" => Ok(Self::Cores),
            ConfigThreadsDe::Name(name) => Err(ConfigError::InvalidThreads(name)),
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let toml_string = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&toml_string)?;
    Ok(config)
}
