use geogate::config::{parse_config, Config, ConfigThreads};
use geogate::geoip::GeoIpError;
use geogate::service::{log_response, make_error_response, GeoGateService};

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

const DEFAULT_CONFIG_PATH: &str = "geogate.toml";

async fn handle(
    geogate: Arc<GeoGateService>,
    remote_ip: IpAddr,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = geogate
        .response(request)
        .await
        .unwrap_or_else(make_error_response);
    log_response(remote_ip, &method, &uri, &response);
    Ok(response)
}

async fn serve(host: SocketAddr, geogate: Arc<GeoGateService>) -> hyper::Result<()> {
    let make_service = make_service_fn(move |connection: &AddrStream| {
        let remote_ip = connection.remote_addr().ip();
        let geogate = geogate.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle(geogate.clone(), remote_ip, request)
            }))
        }
    });

    let server = Server::try_bind(&host)?.serve(make_service);
    log::info!("listening on http://{}", server.local_addr());
    server.await
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    simple_logger::init_with_level(config.log_level)?;
    let host = config.host;

    // Startup fails here if the index cannot be built
    let geogate = tokio::task::spawn_blocking(move || -> Result<_, GeoIpError> {
        GeoGateService::from_config(config).map(Arc::new)
    })
    .await??;

    serve(host, geogate).await?;
    Err(anyhow::anyhow!("server exited"))
}

#[cfg(feature = "multi-thread")]
fn runtime(threads: ConfigThreads) -> std::io::Result<Runtime> {
    let mut builder = match threads {
        ConfigThreads::Custom(threads) if threads.get() == 1 => Builder::new_current_thread(),
        ConfigThreads::Custom(threads) => {
            let mut builder = Builder::new_multi_thread();
            builder.worker_threads(threads.get());
            builder
        }
        ConfigThreads::Cores => Builder::new_multi_thread(),
    };
    builder.enable_all().build()
}

#[cfg(not(feature = "multi-thread"))]
fn runtime(threads: ConfigThreads) -> std::io::Result<Runtime> {
    if threads != ConfigThreads::Cores {
        eprintln!("threads option is ignored without the multi-thread feature");
    }
    Builder::new_current_thread().enable_all().build()
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = parse_config(config_path)?;

    runtime(config.threads)?.block_on(async_main(config))
}
