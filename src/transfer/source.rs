//! Upload byte source / 上传数据源
//!
//! The source is owned by exactly one transfer. Non-seekable readers are
//! spooled into a private temp file when the full content hash is needed;
//! the temp file is removed when the source is dropped, on success and on
//! failure alike.

use bytes::{Buf, Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::hash::HashAlgorithm;
use super::planner::Chunk;
use crate::error::{TransferError, TransferResult};

const COPY_BUFFER: usize = 64 * 1024;

enum SourceInner {
    File(tokio::fs::File),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

pub struct UploadSource {
    inner: SourceInner,
    size: u64,
    /// Bytes pulled from a stream but not yet handed out / 已读取未消费的数据
    head: BytesMut,
    /// Logical offset of the next byte to hand out / 下一个字节的偏移
    position: u64,
    spool: Option<tempfile::TempPath>,
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSource")
            .field("seekable", &self.is_seekable())
            .field("size", &self.size)
            .field("position", &self.position)
            .field("spooled", &self.spool.is_some())
            .finish()
    }
}

impl UploadSource {
    pub fn from_file(file: tokio::fs::File, size: u64) -> Self {
        Self {
            inner: SourceInner::File(file),
            size,
            head: BytesMut::new(),
            position: 0,
            spool: None,
        }
    }

    /// Open a local file as a seekable source / 打开本地文件
    pub async fn open(path: impl AsRef<Path>) -> TransferResult<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        Ok(Self::from_file(file, size))
    }

    /// Wrap a forward-only reader whose total length is known / 包装只读流
    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>, size: u64) -> Self {
        Self {
            inner: SourceInner::Stream(reader),
            size,
            head: BytesMut::new(),
            position: 0,
            spool: None,
        }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self::from_reader(Box::new(std::io::Cursor::new(data)), size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.inner, SourceInner::File(_))
    }

    pub fn is_spooled(&self) -> bool {
        self.spool.is_some()
    }

    /// Read up to `n` leading bytes without consuming them / 读取头部数据（不消费）
    pub async fn prefix(&mut self, n: usize) -> TransferResult<Bytes> {
        match &mut self.inner {
            SourceInner::File(file) => {
                file.seek(SeekFrom::Start(0)).await?;
                let mut buf = BytesMut::with_capacity(n);
                while buf.len() < n {
                    let read = (&mut *file).take((n - buf.len()) as u64).read_buf(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                }
                file.seek(SeekFrom::Start(0)).await?;
                self.position = 0;
                Ok(buf.freeze())
            }
            SourceInner::Stream(reader) => {
                if self.position != 0 {
                    return Err(TransferError::protocol(
                        "prefix requested after the stream was consumed",
                        format!("position={}", self.position),
                    ));
                }
                while self.head.len() < n {
                    let read = (&mut *reader)
                        .take((n - self.head.len()) as u64)
                        .read_buf(&mut self.head)
                        .await?;
                    if read == 0 {
                        break;
                    }
                }
                let take = n.min(self.head.len());
                Ok(Bytes::copy_from_slice(&self.head[..take]))
            }
        }
    }

    /// Hash the whole content once. A stream is spooled into a temp file in
    /// the same pass and the source becomes seekable afterwards.
    /// 计算全量哈希（必要时落盘）
    pub async fn full_hash(
        &mut self,
        algorithm: HashAlgorithm,
        temp_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> TransferResult<String> {
        if !self.is_seekable() {
            return self.spool(algorithm, temp_dir, cancel).await;
        }
        let SourceInner::File(file) = &mut self.inner else {
            return Err(TransferError::protocol("source kind changed while hashing", ""));
        };
        file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        file.seek(SeekFrom::Start(0)).await?;
        self.position = 0;
        Ok(hasher.finalize_hex())
    }

    async fn spool(
        &mut self,
        algorithm: HashAlgorithm,
        temp_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> TransferResult<String> {
        if self.position != 0 {
            return Err(TransferError::protocol(
                "cannot spool a partially consumed stream",
                format!("position={}", self.position),
            ));
        }
        let SourceInner::Stream(reader) = &mut self.inner else {
            return Err(TransferError::protocol("only streams are spooled", ""));
        };

        let named = match temp_dir {
            Some(dir) => tempfile::Builder::new().prefix("file-").tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix("file-").tempfile()?,
        };
        let (std_file, temp_path) = named.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);
        tracing::debug!("spooling stream of {} bytes to {:?}", self.size, temp_path);

        let mut hasher = algorithm.hasher();
        hasher.update(&self.head);
        file.write_all(&self.head).await?;
        let mut written = self.head.len() as u64;

        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            if cancel.is_cancelled() {
                // temp_path dropped here removes the file / 取消时删除临时文件
                return Err(TransferError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;

        if written != self.size {
            return Err(TransferError::protocol(
                "stream length differs from declared size",
                format!("declared={}, read={}", self.size, written),
            ));
        }

        file.seek(SeekFrom::Start(0)).await?;
        self.inner = SourceInner::File(file);
        self.head.clear();
        self.position = 0;
        self.spool = Some(temp_path);
        Ok(hasher.finalize_hex())
    }

    /// Read `len` bytes at `offset`; seekable sources only / 随机读取
    pub async fn read_at(&mut self, offset: u64, len: u64) -> TransferResult<Bytes> {
        let SourceInner::File(file) = &mut self.inner else {
            return Err(TransferError::protocol("random read on a non-seekable source", ""));
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        self.position = offset + len;
        Ok(Bytes::from(buf))
    }

    /// Read exactly the bytes of `chunk` / 读取一个分片
    ///
    /// Streams must be read in chunk order; files may jump anywhere.
    pub async fn read_chunk(&mut self, chunk: &Chunk) -> TransferResult<Bytes> {
        if chunk.end() > self.size {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {} ends at {} beyond source size {}",
                chunk.index,
                chunk.end(),
                self.size
            )));
        }
        if self.is_seekable() {
            return self.read_at(chunk.offset, chunk.length).await;
        }

        if self.position != chunk.offset {
            return Err(TransferError::protocol(
                "non-seekable source read out of order",
                format!("position={}, chunk offset={}", self.position, chunk.offset),
            ));
        }
        let SourceInner::Stream(reader) = &mut self.inner else {
            return Err(TransferError::protocol("source kind changed during read", ""));
        };

        let len = chunk.length as usize;
        let mut buf = BytesMut::with_capacity(len);
        let from_head = len.min(self.head.len());
        buf.extend_from_slice(&self.head[..from_head]);
        self.head.advance(from_head);

        if buf.len() < len {
            let start = buf.len();
            buf.resize(len, 0);
            reader.read_exact(&mut buf[start..]).await?;
        }
        self.position += chunk.length;
        Ok(buf.freeze())
    }

    /// Move back to the first byte / 回到起始位置
    pub async fn rewind(&mut self) -> TransferResult<()> {
        match &mut self.inner {
            SourceInner::File(file) => {
                file.seek(SeekFrom::Start(0)).await?;
                self.position = 0;
                Ok(())
            }
            SourceInner::Stream(_) if self.position == 0 => Ok(()),
            SourceInner::Stream(_) => Err(TransferError::protocol(
                "cannot rewind a consumed stream",
                format!("position={}", self.position),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_stream_prefix_is_not_consumed() {
        let bytes = data(100);
        let mut src = UploadSource::from_bytes(Bytes::from(bytes.clone()));
        let head = src.prefix(10).await.unwrap();
        assert_eq!(&head[..], &bytes[..10]);

        let chunk = Chunk { index: 0, offset: 0, length: 60 };
        let got = src.read_chunk(&chunk).await.unwrap();
        assert_eq!(&got[..], &bytes[..60]);
        let chunk = Chunk { index: 1, offset: 60, length: 40 };
        let got = src.read_chunk(&chunk).await.unwrap();
        assert_eq!(&got[..], &bytes[60..]);
    }

    #[tokio::test]
    async fn test_stream_out_of_order_rejected() {
        let mut src = UploadSource::from_bytes(Bytes::from(data(20)));
        let chunk = Chunk { index: 1, offset: 10, length: 10 };
        assert!(matches!(
            src.read_chunk(&chunk).await,
            Err(TransferError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_spool_makes_seekable_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = data(200_000);
        let mut src = UploadSource::from_bytes(Bytes::from(bytes.clone()));
        src.prefix(1024).await.unwrap();

        let hash = src
            .full_hash(HashAlgorithm::Sha1, Some(dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hash, HashAlgorithm::Sha1.digest_hex(&bytes));
        assert!(src.is_seekable());
        assert!(src.is_spooled());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let window = src.read_at(199_990, 8).await.unwrap();
        assert_eq!(&window[..], &bytes[199_990..199_998]);

        drop(src);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_spool_cancelled_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut src = UploadSource::from_bytes(Bytes::from(data(1000)));
        let result = src
            .full_hash(HashAlgorithm::Sha1, Some(dir.path()), &cancel)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_file_source_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let bytes = data(5000);
        std::fs::write(&path, &bytes).unwrap();

        let mut src = UploadSource::open(&path).await.unwrap();
        assert_eq!(src.size(), 5000);
        assert_eq!(&src.prefix(16).await.unwrap()[..], &bytes[..16]);

        let chunk = Chunk { index: 2, offset: 4000, length: 1000 };
        assert_eq!(&src.read_chunk(&chunk).await.unwrap()[..], &bytes[4000..]);
        let chunk = Chunk { index: 0, offset: 0, length: 10 };
        assert_eq!(&src.read_chunk(&chunk).await.unwrap()[..], &bytes[..10]);

        let hash = src
            .full_hash(HashAlgorithm::Md5, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hash, HashAlgorithm::Md5.digest_hex(&bytes));
        assert!(!src.is_spooled());
    }
}
