//! HTTP part/chunk transports shared by HTTP-based drivers / 基于 HTTP 的分片传输

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

use crate::error::{TransferError, TransferResult};
use crate::transfer::{ChunkDescriptor, ChunkFetchTransport, PartTarget, PartTransport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// PUT parts and GET chunks with a shared reqwest client / 分片上传与下载
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Map reqwest failures onto the transfer taxonomy / 请求错误分类
pub fn classify(err: reqwest::Error) -> TransferError {
    if err.is_decode() || err.is_builder() {
        return TransferError::protocol("malformed http exchange", err.to_string());
    }
    TransferError::Transient(err.to_string())
}

fn apply_headers(mut req: reqwest::RequestBuilder, headers: &[(String, String)]) -> reqwest::RequestBuilder {
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    req
}

#[async_trait]
impl PartTransport for HttpTransport {
    async fn put(&self, target: &PartTarget, data: Bytes) -> TransferResult<u16> {
        let len = data.len();
        let req = apply_headers(self.client.put(&target.url), &target.headers).body(data);
        let resp = req.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        tracing::debug!("part {} PUT {} bytes -> {}", target.part_number, len, status);
        Ok(status)
    }
}

/// Non-2xx statuses: 408/429/5xx are transient, the rest carry the body
/// 状态码分类
async fn check(resp: reqwest::Response, what: &str) -> TransferResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        408 | 429 | 500..=599 => TransferError::Transient(format!("{} status {}", what, status)),
        _ => TransferError::protocol(format!("{} status {}", what, status), body),
    })
}

impl HttpTransport {
    /// GET a whole object, `None` on 404 / 读取对象
    pub async fn fetch(&self, url: &str, headers: &[(String, String)]) -> TransferResult<Option<Bytes>> {
        let resp = apply_headers(self.client.get(url), headers)
            .send()
            .await
            .map_err(classify)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, url).await?;
        resp.bytes().await.map(Some).map_err(classify)
    }

    /// PUT a whole object / 写入对象
    pub async fn store(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> TransferResult<()> {
        let resp = apply_headers(self.client.put(url), headers)
            .body(body)
            .send()
            .await
            .map_err(classify)?;
        check(resp, url).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkFetchTransport for HttpTransport {
    async fn get(&self, descriptor: &ChunkDescriptor) -> TransferResult<Bytes> {
        let resp = apply_headers(self.client.get(&descriptor.url), &descriptor.headers)
            .send()
            .await
            .map_err(classify)?;
        let resp = check(resp, &format!("chunk {}", descriptor.index)).await?;
        resp.bytes().await.map_err(classify)
    }
}
