//! HTTP 分片对象存储驱动
//!
//! Stores each upload part as its own object on a server that only needs to
//! accept PUT and GET (WebDAV, nginx dav, S3-style presigned gateways).
//! A JSON manifest per file and a shared index make it listable and readable.

pub mod driver;
pub mod server;
pub mod types;

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::time::Duration;

use crate::drivers::http::HttpTransport;
use crate::storage::{DriverFactory, StorageDriver};

pub use driver::HttpChunkedDriver;
pub use server::ObjectServer;
pub use types::HttpChunkedOptions;

impl HttpChunkedDriver {
    /// Build from parsed options over an existing transport / 由配置构建驱动
    pub fn from_options(options: &HttpChunkedOptions, http: HttpTransport) -> Result<Self> {
        let transfer = options.transfer_config().map_err(|e| anyhow!(e))?;
        let server = ObjectServer::new(http.clone(), options.base_url(), options.auth_headers());
        Ok(Self::new(server, http, transfer))
    }
}

pub struct HttpChunkedDriverFactory;

impl DriverFactory for HttpChunkedDriverFactory {
    fn driver_type(&self) -> &'static str {
        "http_chunked"
    }

    fn create_driver(&self, config: Value) -> Result<Box<dyn StorageDriver>> {
        let options: HttpChunkedOptions = serde_json::from_value(config)
            .map_err(|e| anyhow!("Invalid http_chunked config: {}", e))?;
        let http = HttpTransport::with_timeout(Duration::from_secs(options.timeout_secs))?;
        let driver = HttpChunkedDriver::from_options(&options, http)?;
        tracing::info!("HTTP chunked driver initialized, base: {}", options.base_url());
        Ok(Box::new(driver))
    }
}
