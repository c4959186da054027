use async_trait::async_trait;
use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::server::ObjectServer;
use super::types::IndexEntry;
use crate::config::TransferConfig;
use crate::drivers::http::HttpTransport;
use crate::storage::{
    Capability, ChunkedDownloader, ChunkedUploader, Entry, Link, Linker, Lister, ProgressCallback,
    StorageDriver,
};
use crate::transfer::{HashAlgorithm, PutOutcome, RemoteObject, TransferEngine, UploadSource};
use crate::utils::fix_and_clean_path;

/// Chunked files on any server that accepts plain PUT/GET
/// 基于 HTTP PUT/GET 的分片存储驱动
pub struct HttpChunkedDriver {
    server: Arc<ObjectServer>,
    http: Arc<HttpTransport>,
    engine: TransferEngine,
}

impl HttpChunkedDriver {
    pub fn new(server: ObjectServer, http: HttpTransport, transfer: TransferConfig) -> Self {
        let server = Arc::new(server);
        let http = Arc::new(http);
        let engine = TransferEngine::new(transfer, server.clone(), http.clone());
        Self { server, http, engine }
    }
}

/// Direct children of `dir` from the flat index / 从索引中取直接子项
fn children(index: &[IndexEntry], dir: &str) -> Vec<Entry> {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
    let mut dirs = BTreeSet::new();
    let mut files = Vec::new();

    for entry in index {
        let Some(rest) = entry.path.strip_prefix(&prefix) else {
            continue;
        };
        match rest.split_once('/') {
            Some((sub, _)) => {
                dirs.insert(sub.to_string());
            }
            None => files.push(Entry {
                name: rest.to_string(),
                path: entry.path.clone(),
                is_dir: false,
                size: entry.size,
                modified: Some(entry.modified.clone()),
            }),
        }
    }

    let mut result: Vec<Entry> = dirs
        .into_iter()
        .map(|name| Entry {
            path: format!("{}{}", prefix, name),
            name,
            is_dir: true,
            size: 0,
            modified: None,
        })
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    result.extend(files);
    result
}

#[async_trait]
impl Lister for HttpChunkedDriver {
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let index = self.server.index().await?;
        Ok(children(&index, &fix_and_clean_path(path)))
    }
}

#[async_trait]
impl Linker for HttpChunkedDriver {
    /// Parts are separate objects, so reads are proxied / 分片对象只能代理读取
    async fn link(&self, path: &str, range: Option<Range<u64>>) -> Result<Link> {
        let object = self.remote_object(path).await?;
        let cancel = CancellationToken::new();
        let reader = match range {
            Some(r) if r.start > r.end => {
                return Err(anyhow!("Invalid range {}..{}", r.start, r.end));
            }
            Some(r) => object.open_range(r.start, Some(r.end - r.start), cancel),
            None => object.open(0, cancel),
        };
        Ok(Link::Reader(Box::new(reader.into_async_read())))
    }
}

#[async_trait]
impl ChunkedUploader for HttpChunkedDriver {
    async fn put_chunked(
        &self,
        path: &str,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        let path = fix_and_clean_path(path);
        Ok(self.engine.put(&path, source, "", progress, cancel).await?)
    }
}

#[async_trait]
impl ChunkedDownloader for HttpChunkedDriver {
    async fn remote_object(&self, path: &str) -> Result<RemoteObject> {
        let path = fix_and_clean_path(path);
        let manifest = self
            .server
            .manifest(&path)
            .await?
            .ok_or_else(|| anyhow!("File not found: {}", path))?;

        let mut object = RemoteObject::new(self.http.clone(), self.server.descriptors(&manifest))
            .with_retry(self.engine.config().retry_policy());
        if let Some(sha1) = manifest.sha1 {
            object = object.with_digest(HashAlgorithm::Sha1, sha1);
        }
        Ok(object)
    }
}

impl StorageDriver for HttpChunkedDriver {
    fn name(&self) -> &str {
        "http_chunked"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn capabilities(&self) -> Capability {
        let config = self.engine.config();
        Capability {
            can_range_read: true,
            can_direct_link: false,
            can_multipart_upload: true,
            can_concurrent_upload: config.concurrency > 1,
            can_rapid_upload: false,
            max_chunk_size: Some(config.max_chunk_size),
            max_file_size: None,
        }
    }

    fn as_uploader(&self) -> Option<&dyn ChunkedUploader> {
        Some(self)
    }

    fn as_downloader(&self) -> Option<&dyn ChunkedDownloader> {
        Some(self)
    }
}
