pub use config::GeoIpConfig;
pub use error::{ConfigError, ExtractError, FetchError, GeoIpError, ParseError, RecordError};
pub use index::GeoIndex;
pub use record::GeonameId;
use record::{CountryLocationRecord, CsvRecord, Ipv4BlockRecord, Ipv6BlockRecord};
use retriever::Retriever;
use updater::GeoIpUpdater;

pub mod archive;
pub mod config;
mod error;
pub mod index;
pub mod record;
pub mod retriever;
pub mod updater;

use hyper::client::connect::Connect;
use hyper::client::Client;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// The three CSV files of a GeoLite2 Country dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFiles {
    pub ipv4: PathBuf,
    pub ipv6: PathBuf,
    pub locations: PathBuf,
}

impl DatasetFiles {
    pub const IPV4_FILE_NAME: &'static str = "GeoLite2-Country-Blocks-IPv4.csv";
    pub const IPV6_FILE_NAME: &'static str = "GeoLite2-Country-Blocks-IPv6.csv";

    pub fn locations_file_name(locale: &str) -> String {
        format!("GeoLite2-Country-Locations-{locale}.csv")
    }

    /// Find the files anywhere below `root`
    pub fn locate(root: &Path, locale: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            ipv4: archive::find_file(root, Self::IPV4_FILE_NAME)?,
            ipv6: archive::find_file(root, Self::IPV6_FILE_NAME)?,
            locations: archive::find_file(root, &Self::locations_file_name(locale))?,
        })
    }

    fn parse_file<T: CsvRecord>(path: &Path) -> Result<Vec<T>, GeoIpError> {
        let file = File::open(path).map_err(|error| GeoIpError::FileIoError {
            path: path.to_owned(),
            error,
        })?;
        record::parse_records(BufReader::new(file)).map_err(|error| GeoIpError::FileCorrupted {
            path: path.to_owned(),
            error,
        })
    }

    pub fn build_index(&self) -> Result<GeoIndex, GeoIpError> {
        let ipv4: Vec<Ipv4BlockRecord> = Self::parse_file(&self.ipv4)?;
        let ipv6: Vec<Ipv6BlockRecord> = Self::parse_file(&self.ipv6)?;
        let countries: Vec<CountryLocationRecord> = Self::parse_file(&self.locations)?;
        let index = GeoIndex::build(ipv4, ipv6, countries);
        if index.countries_len() == 0 || index.is_empty() {
            log::warn!("geo index is empty, every address will be rejected");
        }
        Ok(index)
    }
}

/// Where a [GeoIndex] is built from
pub enum GeoIpSource {
    Folder { path: PathBuf, locale: String },
    Download { retriever: Retriever, locale: String },
}

impl std::fmt::Display for GeoIpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Folder { path, .. } => write!(f, r#"folder "{}""#, path.display()),
            Self::Download { retriever, .. } => write!(f, r#""{}""#, retriever.redacted_uri()),
        }
    }
}

impl GeoIpSource {
    /// Blocking build, downloads the archive if needed
    pub fn load(&self) -> Result<GeoIndex, GeoIpError> {
        match self {
            Self::Folder { path, locale } => DatasetFiles::locate(path, locale)?.build_index(),
            Self::Download { retriever, locale } => {
                let staging = retriever.retrieve()?;
                DatasetFiles::locate(staging.path(), locale)?.build_index()
            }
        }
    }

    /// Download asynchronously, unpack and parse on the blocking pool
    pub async fn load_async<C>(self: Arc<Self>, client: &Client<C>) -> Result<GeoIndex, GeoIpError>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        match &*self {
            Self::Folder { .. } => {
                let source = self.clone();
                tokio::task::spawn_blocking(move || source.load()).await?
            }
            Self::Download { retriever, .. } => {
                let body = retriever.download(client).await?;
                let source = self.clone();
                tokio::task::spawn_blocking(move || -> Result<GeoIndex, GeoIpError> {
                    match &*source {
                        Self::Download { retriever, locale } => {
                            let staging = retriever.unpack(&body)?;
                            DatasetFiles::locate(staging.path(), locale)?.build_index()
                        }
                        Self::Folder { .. } => source.load(),
                    }
                })
                .await?
            }
        }
    }
}

/// Current index, replaced as a whole
#[derive(Clone)]
pub struct SharedIndex(Arc<RwLock<Arc<GeoIndex>>>);

impl SharedIndex {
    pub fn new(index: GeoIndex) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(index))))
    }

    pub fn load(&self) -> Arc<GeoIndex> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, index: GeoIndex) {
        let index = Arc::new(index);
        let mut current = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *current = index;
    }
}

pub struct GeoIp {
    source: Arc<GeoIpSource>,
    index: SharedIndex,
    updater: Option<RwLock<GeoIpUpdater>>,
}

impl GeoIp {
    pub fn new(source: GeoIpSource, index: GeoIndex) -> Self {
        Self {
            source: Arc::new(source),
            index: SharedIndex::new(index),
            updater: None,
        }
    }

    /// Build the index from the configured source, failing on any error
    pub fn load(config: GeoIpConfig) -> Result<Self, GeoIpError> {
        let source = config.source()?;
        log::info!("building geo index from {source}");
        let index = source.load()?;
        let mut geoip = Self::new(source, index);
        geoip.set_updater(config.into_updater());
        Ok(geoip)
    }

    pub fn set_updater(&mut self, updater: Option<GeoIpUpdater>) {
        self.updater = updater.map(RwLock::new);
    }

    pub fn source(&self) -> Arc<GeoIpSource> {
        self.source.clone()
    }

    pub fn shared_index(&self) -> SharedIndex {
        self.index.clone()
    }

    /// Snapshot of the current index
    pub fn index(&self) -> Arc<GeoIndex> {
        self.index.load()
    }

    pub fn publish(&self, index: GeoIndex) {
        self.index.publish(index)
    }

    pub fn is_whitelisted<S>(&self, address: IpAddr, country_codes: &[S]) -> bool
    where
        S: AsRef<str>,
    {
        self.index().is_whitelisted(address, country_codes)
    }

    /// Start the configured updater, must be called within a tokio runtime
    pub fn start_autoupdate(&self) -> bool {
        match &self.updater {
            Some(updater) => updater
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .start(self.source(), self.shared_index())
                .is_some(),
            None => false,
        }
    }
}
