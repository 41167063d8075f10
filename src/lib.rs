pub mod config;
pub mod geoip;
pub mod service;
