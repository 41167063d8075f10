use crate::geoip::archive::{self, ArchiveFormat};
use crate::geoip::error::{ConfigError, FetchError, GeoIpError};

use core::num::NonZeroU32;
use hyper::body::{Body, Bytes};
use hyper::client::connect::Connect;
use hyper::client::{Client, HttpConnector};
use hyper::http::uri::{InvalidUri, Uri};
use hyper_tls::HttpsConnector;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub const MAXMIND_URL_PREFIX: &str = "https://download.maxmind.com/app/geoip_download?edition_id=GeoLite2-Country-CSV&license_key=";

const MAX_REDIRECTS: usize = 8;
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_BACKOFF_SECONDS: u64 = 2;

pub fn https_client() -> Client<HttpsConnector<HttpConnector>, Body> {
    let https = HttpsConnector::new();
    Client::builder().build::<_, Body>(https)
}

/// Downloads the dataset archive and unpacks it into a private staging
/// directory.
pub struct Retriever {
    uri: Uri,
    format: ArchiveFormat,
    staging_root: PathBuf,
    timeout: Duration,
    attempts: NonZeroU32,
    backoff: Duration,
}

/// Unpacked archive, removed from disk on drop
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Retriever {
    pub fn new(
        url_prefix: &str,
        license_key: &str,
        format: ArchiveFormat,
        staging_root: PathBuf,
    ) -> Result<Self, ConfigError> {
        let uri: Uri = format!("{url_prefix}{license_key}&suffix={}", format.suffix())
            .parse()
            .map_err(|error: InvalidUri| ConfigError::InvalidUrlPrefix {
                url_prefix: url_prefix.to_owned(),
                error: error.to_string(),
            })?;
        Ok(Self {
            uri,
            format,
            staging_root,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            attempts: NonZeroU32::MIN,
            backoff: Duration::from_secs(DEFAULT_BACKOFF_SECONDS),
        })
    }

    pub fn with_policy(mut self, timeout: Duration, attempts: NonZeroU32, backoff: Duration) -> Self {
        self.timeout = timeout;
        self.attempts = attempts;
        self.backoff = backoff;
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Download URI without the query, so the license key stays out of logs
    pub fn redacted_uri(&self) -> String {
        format!(
            "{}://{}{}",
            self.uri.scheme_str().unwrap_or("https"),
            self.uri.authority().map_or("", |authority| authority.as_str()),
            self.uri.path(),
        )
    }

    async fn download_archive<C>(client: &Client<C>, mut uri: Uri) -> Result<Bytes, FetchError>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        let mut redirects = 0;
        let response = loop {
            let request = hyper::Request::builder().uri(&uri).body(Body::empty())?;
            let response = client.request(request).await?;

            if response.status().is_success() {
                break response;
            } else if response.status().is_redirection() {
                let location: Uri = response
                    .headers()
                    .get("Location")
                    .ok_or(FetchError::BadRedirect(response.status()))?
                    .as_bytes()
                    .try_into()
                    .map_err(|_| FetchError::BadRedirect(response.status()))?;
                uri = resolve_location(&uri, location)?;
            } else {
                return Err(response.status().into());
            }

            redirects += 1;
            if redirects == MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects(redirects));
            }
        };
        let body = response.into_body();
        Ok(hyper::body::to_bytes(body).await?)
    }

    /// Download the archive, retrying transient failures with exponential
    /// backoff. Every attempt is bounded by the configured timeout.
    pub async fn download<C>(&self, client: &Client<C>) -> Result<Bytes, FetchError>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        let mut backoff = self.backoff;
        let mut attempt = 1;
        loop {
            log::info!(
                r#"downloading GeoLite2 archive from "{}" (attempt {attempt})"#,
                self.redacted_uri()
            );
            let result = match tokio::time::timeout(
                self.timeout,
                Self::download_archive(client, self.uri.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.timeout)),
            };
            match result {
                Ok(body) => return Ok(body),
                Err(error) if error.is_transient() && attempt < self.attempts.get() => {
                    log::warn!("download attempt {attempt} failed: {error}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Write the downloaded archive to a fresh staging directory and unpack
    /// it there.
    pub fn unpack(&self, body: &[u8]) -> Result<Staging, GeoIpError> {
        let staging_error = |error| GeoIpError::StagingIoError {
            path: self.staging_root.clone(),
            error,
        };
        std::fs::create_dir_all(&self.staging_root).map_err(staging_error)?;
        let dir = tempfile::Builder::new()
            .prefix("geogate-")
            .tempdir_in(&self.staging_root)
            .map_err(staging_error)?;

        let archive_path = dir.path().join(format!("GeoLite2-Country-CSV.{}", self.format.suffix()));
        std::fs::write(&archive_path, body).map_err(|error| GeoIpError::StagingIoError {
            path: archive_path.clone(),
            error,
        })?;
        archive::extract(&archive_path, self.format, &dir.path().join("extracted"))?;
        log::info!(
            r#"GeoLite2 archive unpacked to "{}""#,
            dir.path().display()
        );
        Ok(Staging { dir })
    }

    /// Blocking download and unpack, for the startup path
    pub fn retrieve(&self) -> Result<Staging, GeoIpError> {
        let client = https_client();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(GeoIpError::Runtime)?;
        let body = rt.block_on(self.download(&client))?;
        self.unpack(&body)
    }
}

/// Location headers may be relative to the request URI
fn resolve_location(base: &Uri, location: Uri) -> Result<Uri, FetchError> {
    if location.authority().is_some() {
        return Ok(location);
    }
    let mut builder = Uri::builder();
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    let path_and_query = location
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    Ok(builder.path_and_query(path_and_query).build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::archive::tests::zip_bytes;
    use crate::geoip::error::ExtractError;

    use hyper::server::conn::AddrStream;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const LICENSE_KEY: &str = "secret_KEY1";

    fn route(request: &Request<Body>, archive: &[u8], hits: &AtomicUsize) -> Response<Body> {
        let query = request.uri().query().unwrap_or("");
        let builder = Response::builder();
        let response = match request.uri().path() {
            "/archive" if query == format!("license_key={LICENSE_KEY}&suffix=zip") => {
                builder.status(StatusCode::OK).body(Body::from(archive.to_vec()))
            }
            "/redirect" => builder
                .status(StatusCode::FOUND)
                .header("Location", format!("/archive?{query}"))
                .body(Body::empty()),
            "/loop" => builder
                .status(StatusCode::FOUND)
                .header("Location", "/loop?x")
                .body(Body::empty()),
            "/flaky" if hits.fetch_add(1, Ordering::SeqCst) == 0 => builder
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::empty()),
            "/flaky" => builder.status(StatusCode::OK).body(Body::from(archive.to_vec())),
            "/unavailable" => {
                hits.fetch_add(1, Ordering::SeqCst);
                builder
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::empty())
            }
            "/denied" => {
                hits.fetch_add(1, Ordering::SeqCst);
                builder.status(StatusCode::UNAUTHORIZED).body(Body::empty())
            }
            _ => builder.status(StatusCode::NOT_FOUND).body(Body::empty()),
        };
        response.unwrap()
    }

    async fn start_server(archive: Vec<u8>) -> (SocketAddr, Arc<AtomicUsize>) {
        let archive = Arc::new(archive);
        let hits = Arc::new(AtomicUsize::new(0));
        let service_hits = hits.clone();
        let make_service = make_service_fn(move |_connection: &AddrStream| {
            let archive = archive.clone();
            let hits = service_hits.clone();
            let service = service_fn(move |request: Request<Body>| {
                let response = route(&request, &archive, &hits);
                async move { Ok::<_, Infallible>(response) }
            });
            async move { Ok::<_, Infallible>(service) }
        });
        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server);
        (addr, hits)
    }

    fn retriever(addr: SocketAddr, path: &str, staging_root: &Path) -> Retriever {
        Retriever::new(
            &format!("http://{addr}{path}?license_key="),
            LICENSE_KEY,
            ArchiveFormat::Zip,
            staging_root.to_owned(),
        )
        .unwrap()
        .with_policy(
            Duration::from_secs(5),
            NonZeroU32::new(3).unwrap(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn maxmind_uri() {
        let retriever = Retriever::new(
            MAXMIND_URL_PREFIX,
            LICENSE_KEY,
            ArchiveFormat::Zip,
            PathBuf::from("/tmp"),
        )
        .unwrap();
        assert_eq!(
            retriever.uri().to_string(),
            "https://download.maxmind.com/app/geoip_download?edition_id=GeoLite2-Country-CSV&license_key=secret_KEY1&suffix=zip"
        );
        assert_eq!(
            retriever.redacted_uri(),
            "https://download.maxmind.com/app/geoip_download"
        );
    }

    #[test]
    fn invalid_url_prefix_is_a_config_error() {
        let error = Retriever::new(
            "https://example.com/a b?key=",
            LICENSE_KEY,
            ArchiveFormat::Zip,
            PathBuf::from("/tmp"),
        )
        .err()
        .unwrap();
        assert!(matches!(
            error,
            ConfigError::InvalidUrlPrefix { url_prefix, .. } if url_prefix == "https://example.com/a b?key="
        ));
    }

    #[test]
    fn relative_location() {
        let base: Uri = "https://example.com/a?b".parse().unwrap();
        let resolved = resolve_location(&base, "/c?d".parse().unwrap()).unwrap();
        assert_eq!(resolved, "https://example.com/c?d".parse::<Uri>().unwrap());
        let absolute: Uri = "https://other.org/x".parse().unwrap();
        assert_eq!(resolve_location(&base, absolute.clone()).unwrap(), absolute);
    }

    #[tokio::test]
    async fn download_and_unpack() {
        let bytes = zip_bytes(&[("GeoLite2-Country-CSV_20240101/a.csv", Some(b"a"))]);
        let (addr, _) = start_server(bytes.clone()).await;
        let staging_root = tempfile::tempdir().unwrap();
        let retriever = retriever(addr, "/archive", staging_root.path());
        let client = Client::new();

        let body = retriever.download(&client).await.unwrap();
        assert_eq!(body.as_ref(), bytes.as_slice());

        let staging = retriever.unpack(&body).unwrap();
        assert!(staging.path().starts_with(staging_root.path()));
        let file = archive::find_file(staging.path(), "a.csv").unwrap();
        assert_eq!(std::fs::read(file).unwrap(), b"a");

        let staging_path = staging.path().to_owned();
        drop(staging);
        assert!(!staging_path.exists());
    }

    #[tokio::test]
    async fn follows_relative_redirect() {
        let archive = zip_bytes(&[("a.csv", Some(b"a"))]);
        let (addr, _) = start_server(archive.clone()).await;
        let staging_root = tempfile::tempdir().unwrap();
        let retriever = retriever(addr, "/redirect", staging_root.path());
        let body = retriever.download(&Client::new()).await.unwrap();
        assert_eq!(body.as_ref(), archive.as_slice());
    }

    #[tokio::test]
    async fn redirect_loop_gives_up() {
        let (addr, _) = start_server(vec![]).await;
        let staging_root = tempfile::tempdir().unwrap();
        let retriever = retriever(addr, "/loop", staging_root.path());
        let error = retriever.download(&Client::new()).await.unwrap_err();
        assert!(matches!(error, FetchError::TooManyRedirects(MAX_REDIRECTS)));
    }

    #[tokio::test]
    async fn non_success_status() {
        let (addr, hits) = start_server(vec![]).await;
        let staging_root = tempfile::tempdir().unwrap();
        let retriever = retriever(addr, "/denied", staging_root.path());
        let error = retriever.download(&Client::new()).await.unwrap_err();
        assert!(matches!(error, FetchError::NonSuccess(StatusCode::UNAUTHORIZED)));
        // client errors are not retried
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let archive = zip_bytes(&[("a.csv", Some(b"a"))]);
        let (addr, hits) = start_server(archive.clone()).await;
        let staging_root = tempfile::tempdir().unwrap();
        let body = retriever(addr, "/flaky", staging_root.path())
            .download(&Client::new())
            .await
            .unwrap();
        assert_eq!(body.as_ref(), archive.as_slice());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (addr, hits) = start_server(vec![]).await;
        let staging_root = tempfile::tempdir().unwrap();
        let error = retriever(addr, "/unavailable", staging_root.path())
            .download(&Client::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            FetchError::NonSuccess(StatusCode::SERVICE_UNAVAILABLE)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn network_failure() {
        // Nothing listens on a freshly released port
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let staging_root = tempfile::tempdir().unwrap();
        let error = retriever(addr, "/archive", staging_root.path())
            .download(&Client::new())
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::Hyper(_)));
    }

    #[test]
    fn unpack_rejects_traversal() {
        let staging_root = tempfile::tempdir().unwrap();
        let retriever = Retriever::new(
            "http://127.0.0.1/archive?license_key=",
            LICENSE_KEY,
            ArchiveFormat::Zip,
            staging_root.path().to_owned(),
        )
        .unwrap();
        let body = zip_bytes(&[("../../evil.csv", Some(b"evil"))]);
        let error = retriever.unpack(&body).err().unwrap();
        assert!(matches!(
            error,
            GeoIpError::Extract(ExtractError::PathTraversal(_))
        ));
        assert!(!staging_root.path().join("evil.csv").exists());
    }
}
