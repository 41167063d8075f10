use hyper::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoIpError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(r#"Error parsing file "{path}": {error}"#)]
    FileCorrupted { path: PathBuf, error: ParseError },
    #[error(r#"Error while attempting to read file "{path}": {error}"#)]
    FileIoError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error(r#"Error while preparing staging directory "{path}": {error}"#)]
    StagingIoError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("Cannot start download runtime: {0}")]
    Runtime(std::io::Error),
    #[error("Index build task failed: {0}")]
    BuildTask(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no license key given, set geoip.license_key or MAXMIND_LICENSE_KEY")]
    MissingLicenseKey,
    #[error("license key must only contain ASCII letters, digits and underscores")]
    InvalidLicenseKey,
    #[error(r#"threads must be "cores" or a positive number, got "{0}""#)]
    InvalidThreads(String),
    #[error(r#"download url_prefix "{url_prefix}" does not form a valid URI: {error}"#)]
    InvalidUrlPrefix { url_prefix: String, error: String },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] hyper::http::Error),
    #[error("Non-success status code: {0}")]
    NonSuccess(StatusCode),
    #[error("Redirect with status {0} has no usable Location header")]
    BadRedirect(StatusCode),
    #[error("Gave up after {0} redirects")]
    TooManyRedirects(usize),
    #[error("Download did not finish in {0:?}")]
    Timeout(Duration),
}

impl From<StatusCode> for FetchError {
    fn from(status_code: StatusCode) -> Self {
        FetchError::NonSuccess(status_code)
    }
}

impl FetchError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Hyper(_) | Self::Timeout(_) => true,
            Self::NonSuccess(status) => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Archive is corrupted: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Error while unpacking tar.gz: {0}")]
    TarIo(std::io::Error),
    #[error(r#"Archive entry "{0}" points outside of the destination directory"#)]
    PathTraversal(String),
    #[error(r#"Error while writing "{path}": {error}"#)]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error(r#"Archive has no "{0}" file"#)]
    MissingFile(String),
    #[error(r#"Archive has "{name}" twice: "{first}" and "{second}""#)]
    DuplicateFile {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("This build has no tar.gz support, rebuild with the tar-gz feature")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(r#"Line {line} "{record}" is invalid: {error}"#)]
    InvalidRecord {
        line: u64,
        record: String,
        error: RecordError,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("column {index} ({field}) is missing")]
    MissingField { index: usize, field: &'static str },
    #[error(r#"{field} "{value}" is not a valid network"#)]
    Network {
        field: &'static str,
        value: String,
        error: ipnet::AddrParseError,
    },
    #[error(r#"{field} "{value}" is not a valid integer"#)]
    Integer {
        field: &'static str,
        value: String,
        error: std::num::ParseIntError,
    },
    #[error(r#"{field} "{value}" is not a valid boolean"#)]
    Boolean { field: &'static str, value: String },
}
