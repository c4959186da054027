use async_trait::async_trait;
use anyhow::{anyhow, Result};
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::store::ChunkStore;
use crate::config::TransferConfig;
use crate::storage::{
    Capability, ChunkedDownloader, ChunkedUploader, Entry, Link, Linker, Lister, ProgressCallback,
    StorageDriver,
};
use crate::transfer::{HashAlgorithm, PutOutcome, RemoteObject, TransferEngine, UploadSource};

/// Local content-addressed store driven through the transfer engine
/// 基于本地目录的分片存储驱动
pub struct LocalChunkedDriver {
    store: Arc<ChunkStore>,
    engine: TransferEngine,
    download_chunk_size: u64,
}

impl LocalChunkedDriver {
    pub fn new(store: ChunkStore, transfer: TransferConfig, download_chunk_size: u64) -> Self {
        let store = Arc::new(store);
        let engine = TransferEngine::new(transfer, store.clone(), store.clone());
        Self {
            store,
            engine,
            download_chunk_size,
        }
    }
}

#[async_trait]
impl Lister for LocalChunkedDriver {
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        self.store.list(path).await
    }
}

#[async_trait]
impl Linker for LocalChunkedDriver {
    /// Always proxied: the store has no public URL / 本地存储只能代理读取
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
impl ChunkedUploader for LocalChunkedDriver {
    async fn put_chunked(
        &self,
        path: &str,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        let outcome = self
            .engine
            .put(path, source, self.store.secret(), progress, cancel)
            .await?;
        Ok(outcome)
    }
}

#[async_trait]
impl ChunkedDownloader for LocalChunkedDriver {
    async fn remote_object(&self, path: &str) -> Result<RemoteObject> {
        let record = self
            .store
            .lookup(path)
            .await?
            .ok_or_else(|| anyhow!("File not found: {}", path))?;
        let chunks = self.store.descriptors(&record, self.download_chunk_size);
        Ok(RemoteObject::new(self.store.clone(), chunks)
            .with_digest(HashAlgorithm::Sha1, record.sha1)
            .with_retry(self.engine.config().retry_policy()))
    }
}

impl StorageDriver for LocalChunkedDriver {
    fn name(&self) -> &str {
        "local_chunked"
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
            can_rapid_upload: config.rapid_upload,
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
