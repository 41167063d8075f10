use crate::config::Config;
use crate::geoip::{GeoIp, GeoIpError};

use hyper::body::HttpBody;
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Path {0} is not found")]
    NotFound(String),
    #[error("Method {0} is not allowed")]
    MethodNotAllowed(Method),
    #[error("Request body is larger than {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Error while reading request body: {0}")]
    Body(#[from] hyper::Error),
    #[error("Invalid request body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error(r#"Invalid IP address "{address}": {error}"#)]
    InvalidIpAddress {
        address: String,
        error: AddrParseError,
    },
    #[error(r#"Internal server error: "{0:?}""#)]
    InternalServerError(#[from] hyper::http::Error),
}

#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    pub ip_address: String,
    #[serde(default)]
    pub countries: Vec<String>,
}

pub struct GeoGateService {
    geoip: GeoIp,
    max_body_size: usize,
}

impl GeoGateService {
    pub fn new(geoip: GeoIp, max_body_size: usize) -> Self {
        Self {
            geoip,
            max_body_size,
        }
    }

    pub fn from_config(config: Config) -> Result<Self, GeoIpError> {
        let Config {
            max_body_size,
            geoip: geoip_config,
            ..
        } = config;

        let geoip = GeoIp::load(geoip_config)?;
        if geoip.start_autoupdate() {
            log::info!("geo index autoupdate started");
        }

        Ok(Self::new(geoip, max_body_size))
    }

    pub fn geoip(&self) -> &GeoIp {
        &self.geoip
    }

    pub async fn response(&self, request: Request<Body>) -> Result<Response<Body>, ServiceError> {
        match (request.method(), request.uri().path()) {
            (&Method::POST, "/auth/ip") => self.auth_ip(request.into_body()).await,
            (&Method::GET, "/ready") => Ok(Response::new(Body::from("good to go!"))),
            (method, "/auth/ip" | "/ready") => Err(ServiceError::MethodNotAllowed(method.clone())),
            (_, path) => Err(ServiceError::NotFound(path.to_owned())),
        }
    }

    async fn auth_ip(&self, body: Body) -> Result<Response<Body>, ServiceError> {
        let bytes = read_body(body, self.max_body_size).await?;
        let request: WhitelistRequest = serde_json::from_slice(&bytes)?;
        let address: IpAddr =
            request
                .ip_address
                .parse()
                .map_err(|error| ServiceError::InvalidIpAddress {
                    address: request.ip_address.clone(),
                    error,
                })?;

        let status = if self.geoip.is_whitelisted(address, &request.countries) {
            StatusCode::OK
        } else {
            log::info!("ip not whitelisted {address}");
            StatusCode::UNAUTHORIZED
        };
        Ok(Response::builder().status(status).body(Body::empty())?)
    }
}

async fn read_body(mut body: Body, limit: usize) -> Result<Vec<u8>, ServiceError> {
    if body.size_hint().lower() > limit as u64 {
        return Err(ServiceError::PayloadTooLarge(limit));
    }
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(ServiceError::PayloadTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

pub fn make_error_response(error: ServiceError) -> Response<Body> {
    let status = match error {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        ServiceError::Body(_)
        | ServiceError::InvalidJson(_)
        | ServiceError::InvalidIpAddress { .. } => StatusCode::BAD_REQUEST,
        ServiceError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log::warn!("{error}");
    let mut response = Response::new(Body::from(error.to_string()));
    *response.status_mut() = status;
    response
}

pub fn log_response(
    socket_ip_addr: IpAddr,
    method: &Method,
    uri: &Uri,
    response: &Response<Body>,
) {
    log::info!(
        "{} {} {} {}",
        socket_ip_addr,
        method,
        uri,
        response.status(),
    );
}
