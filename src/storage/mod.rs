use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::transfer::{PutOutcome, RemoteObject, UploadSource};

/// 进度回调类型 / Progress callback type
/// 参数: (已完成字节数, 总字节数) / Parameters: (completed_bytes, total_bytes)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// File entry information / 文件条目信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}

/// Driver capability declaration / 驱动能力声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capability {
    /// Support range reading (resumable download) / 支持范围读取
    pub can_range_read: bool,
    /// Support direct link download / 支持直链下载
    pub can_direct_link: bool,
    /// Support multipart upload / 支持分片上传
    pub can_multipart_upload: bool,
    /// Support concurrent part upload / 支持并发上传
    pub can_concurrent_upload: bool,
    /// Support hash-based rapid upload / 支持秒传
    pub can_rapid_upload: bool,
    /// Maximum chunk size (None means no limit) / 最大分片大小
    pub max_chunk_size: Option<u64>,
    /// Maximum file size limit (None means no limit) / 最大文件大小限制
    pub max_file_size: Option<u64>,
}

/// How to fetch a file / 文件获取方式
pub enum Link {
    /// Direct URL with the headers the vendor requires / 直链
    Url {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Bytes proxied through the driver / 由驱动代理的数据流
    Reader(Box<dyn AsyncRead + Unpin + Send>),
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Url { url, .. } => f.debug_struct("Url").field("url", url).finish(),
            Link::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

#[async_trait]
pub trait Lister: Send + Sync {
    /// List directory contents / 列出目录内容
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;
}

#[async_trait]
pub trait Linker: Send + Sync {
    /// Resolve a file to a link, optionally for a byte range / 获取文件链接
    async fn link(&self, path: &str, range: Option<Range<u64>>) -> Result<Link>;
}

/// Optional: multipart upload through the transfer engine / 分片上传能力
#[async_trait]
pub trait ChunkedUploader: Send + Sync {
    async fn put_chunked(
        &self,
        path: &str,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome>;
}

/// Optional: lazily fetched chunked reads / 分片下载能力
#[async_trait]
pub trait ChunkedDownloader: Send + Sync {
    /// Chunk layout and declared digest of `path` / 获取远端对象的分片布局
    async fn remote_object(&self, path: &str) -> Result<RemoteObject>;
}

/// Storage driver: listing and linking are mandatory, chunked transfer is
/// discovered through `as_uploader` / `as_downloader`.
/// 存储驱动接口
pub trait StorageDriver: Lister + Linker {
    /// Driver name / 驱动名称
    fn name(&self) -> &str;

    /// Driver version / 驱动版本
    fn version(&self) -> &str;

    /// Driver capabilities / 驱动能力
    fn capabilities(&self) -> Capability;

    fn as_uploader(&self) -> Option<&dyn ChunkedUploader> {
        None
    }

    fn as_downloader(&self) -> Option<&dyn ChunkedDownloader> {
        None
    }
}

pub mod manager;

pub use manager::{DriverBox, DriverFactory, StorageManager};

#[cfg(test)]
mod tests {
    use super::*;

    struct ListOnly;

    #[async_trait]
    impl Lister for ListOnly {
        async fn list(&self, _path: &str) -> Result<Vec<Entry>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl Linker for ListOnly {
        async fn link(&self, path: &str, _range: Option<Range<u64>>) -> Result<Link> {
            Ok(Link::Url {
                url: format!("https://example.invalid{}", path),
                headers: HashMap::new(),
            })
        }
    }

    impl StorageDriver for ListOnly {
        fn name(&self) -> &str {
            "list_only"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn capabilities(&self) -> Capability {
            Capability::default()
        }
    }

    #[tokio::test]
    async fn test_optional_capabilities_default_to_none() {
        let driver: Box<dyn StorageDriver> = Box::new(ListOnly);
        assert!(driver.as_uploader().is_none());
        assert!(driver.as_downloader().is_none());
        let link = driver.link("/a.txt", None).await.unwrap();
        assert!(matches!(link, Link::Url { ref url, .. } if url.ends_with("/a.txt")));
    }
}
