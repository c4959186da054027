//! Lazy reader over a remote object made of independently fetchable chunks
//! 分片远端对象的惰性读取器
//!
//! Chunks are pulled one at a time as the consumer reads. Opening at an offset
//! skips whole chunks by index arithmetic and discards the leading bytes of
//! the first fetched chunk. Only a read that started at byte 0 and reached
//! logical EOF is checked against the declared digest.

use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::hash::{HashAlgorithm, IntegrityState};
use super::retry::RetryPolicy;
use super::transport::{ChunkDescriptor, ChunkFetchTransport};
use crate::error::{TransferError, TransferResult};

/// Remote object description from which readers are opened / 远端对象
#[derive(Clone)]
pub struct RemoteObject {
    transport: Arc<dyn ChunkFetchTransport>,
    chunks: Arc<Vec<ChunkDescriptor>>,
    digest: Option<(HashAlgorithm, String)>,
    retry: RetryPolicy,
}

impl RemoteObject {
    pub fn new(transport: Arc<dyn ChunkFetchTransport>, chunks: Vec<ChunkDescriptor>) -> Self {
        Self {
            transport,
            chunks: Arc::new(chunks),
            digest: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Server-declared digest of the whole object / 服务端声明的整体摘要
    pub fn with_digest(mut self, algorithm: HashAlgorithm, expected: impl Into<String>) -> Self {
        self.digest = Some((algorithm, expected.into()));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Open at chunk `chunk_index`, dropping `skip` leading bytes / 从指定分片开始读取
    pub fn open_at(&self, chunk_index: usize, skip: u64, cancel: CancellationToken) -> ChunkedRangeReader {
        let full_stream = chunk_index == 0 && skip == 0;
        self.reader(chunk_index, skip, None, full_stream, cancel)
    }

    /// Open at a global byte offset / 从任意字节偏移开始读取
    pub fn open(&self, offset: u64, cancel: CancellationToken) -> ChunkedRangeReader {
        self.open_range(offset, None, cancel)
    }

    /// Open `[offset, offset + len)`; `None` reads to the end / 读取指定区间
    pub fn open_range(&self, offset: u64, len: Option<u64>, cancel: CancellationToken) -> ChunkedRangeReader {
        let (index, skip) = locate(&self.chunks, offset);
        let full_stream = offset == 0 && len.map_or(true, |l| l >= self.size());
        self.reader(index, skip, len, full_stream, cancel)
    }

    fn reader(
        &self,
        chunk_index: usize,
        skip: u64,
        remaining: Option<u64>,
        full_stream: bool,
        cancel: CancellationToken,
    ) -> ChunkedRangeReader {
        let integrity = match (&self.digest, full_stream) {
            (Some((alg, expected)), true) => Some(IntegrityState::new(*alg, expected.clone())),
            _ => None,
        };
        let start: u64 = self.chunks.iter().take(chunk_index).map(|c| c.length).sum();
        ChunkedRangeReader {
            state: Mutex::new(ReaderState {
                transport: self.transport.clone(),
                chunks: self.chunks.clone(),
                retry: self.retry.clone(),
                cancel,
                cursor: DownloadCursor {
                    chunk_index,
                    buffered: Bytes::new(),
                    global_offset: start + skip,
                },
                skip,
                remaining,
                integrity,
                full_stream,
                closed: false,
            }),
        }
    }
}

/// Chunk index and in-chunk skip for a global offset, no network involved
/// 由全局偏移计算分片序号和块内跳过字节数
fn locate(chunks: &[ChunkDescriptor], offset: u64) -> (usize, u64) {
    let mut start = 0u64;
    for (i, c) in chunks.iter().enumerate() {
        if offset < start + c.length {
            return (i, offset - start);
        }
        start += c.length;
    }
    (chunks.len(), 0)
}

/// Read position, owned by a single reader / 读取游标
#[derive(Debug, Clone, Default)]
pub struct DownloadCursor {
    /// Next chunk to fetch / 下一个待拉取的分片
    pub chunk_index: usize,
    pub buffered: Bytes,
    /// Offset of the next byte handed to the caller / 下一个返回字节的全局偏移
    pub global_offset: u64,
}

struct ReaderState {
    transport: Arc<dyn ChunkFetchTransport>,
    chunks: Arc<Vec<ChunkDescriptor>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    cursor: DownloadCursor,
    skip: u64,
    remaining: Option<u64>,
    integrity: Option<IntegrityState>,
    full_stream: bool,
    closed: bool,
}

impl ReaderState {
    fn at_eof(&self) -> bool {
        self.cursor.buffered.is_empty() && self.cursor.chunk_index >= self.chunks.len()
    }

    async fn fetch_next(&mut self) -> TransferResult<()> {
        let desc = &self.chunks[self.cursor.chunk_index];
        let transport = self.transport.as_ref();
        let raw = self
            .retry
            .run(&self.cancel, |_| transport.get(desc))
            .await?;
        let mut data = desc.decode(raw);
        if data.len() as u64 != desc.length {
            return Err(TransferError::protocol(
                "chunk length does not match descriptor",
                format!("index={}, expected={}, got={}", desc.index, desc.length, data.len()),
            ));
        }
        tracing::debug!("fetched chunk {} ({} bytes)", desc.index, data.len());

        if self.skip > 0 {
            let n = self.skip.min(data.len() as u64);
            let _ = data.split_to(n as usize);
            self.skip -= n;
        }
        self.cursor.buffered = data;
        self.cursor.chunk_index += 1;
        Ok(())
    }

    /// Up to `max` bytes, empty at EOF / 读取至多 max 字节，EOF 时返回空
    async fn take(&mut self, max: usize) -> TransferResult<Bytes> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        loop {
            if max == 0 || self.remaining == Some(0) {
                return Ok(Bytes::new());
            }
            if !self.cursor.buffered.is_empty() {
                let mut n = max.min(self.cursor.buffered.len());
                if let Some(r) = self.remaining {
                    n = n.min(r as usize);
                }
                let out = self.cursor.buffered.split_to(n);
                if let Some(integrity) = self.integrity.as_mut() {
                    integrity.update(&out);
                }
                self.cursor.global_offset += n as u64;
                if let Some(r) = self.remaining.as_mut() {
                    *r -= n as u64;
                }
                return Ok(out);
            }
            if self.cursor.chunk_index >= self.chunks.len() {
                return Ok(Bytes::new());
            }
            self.fetch_next().await?;
        }
    }
}

/// Reader handed out by `RemoteObject::open*` / 分片读取器
///
/// Calls are serialized by one internal mutex; use one reader per consumer.
pub struct ChunkedRangeReader {
    state: Mutex<ReaderState>,
}

impl ChunkedRangeReader {
    /// Fill `buf`, returning 0 at EOF / 读取数据，0 表示结束
    pub async fn read(&self, buf: &mut [u8]) -> TransferResult<usize> {
        let mut state = self.state.lock().await;
        let data = state.take(buf.len()).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Next buffered block, `None` at EOF / 下一块数据
    pub async fn next_bytes(&self) -> TransferResult<Option<Bytes>> {
        let mut state = self.state.lock().await;
        let data = state.take(usize::MAX).await?;
        Ok((!data.is_empty()).then_some(data))
    }

    /// Read everything left into memory / 读取剩余全部内容
    pub async fn read_to_end(&self) -> TransferResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(block) = self.next_bytes().await? {
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    pub async fn position(&self) -> u64 {
        self.state.lock().await.cursor.global_offset
    }

    /// Finish the read / 关闭读取器
    ///
    /// A full-stream read that reached EOF is verified against the declared
    /// digest; a mismatch means the bytes already returned are untrusted.
    /// Partial reads skip verification. Closing twice is a no-op.
    pub async fn close(&self) -> TransferResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let verify = state.full_stream && state.at_eof();
        state.cursor.buffered = Bytes::new();

        match state.integrity.as_mut() {
            Some(integrity) if verify => {
                let result = integrity.finalize();
                if let Err(e) = &result {
                    tracing::error!("download integrity check failed: {}", e);
                }
                result
            }
            Some(integrity) => {
                integrity.discard();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Block stream; EOF closes the reader and surfaces a digest mismatch as
    /// a final `InvalidData` error / 转换为字节流
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.next_bytes().await {
                Ok(Some(block)) => Some((Ok(block), Some(reader))),
                Ok(None) => match reader.close().await {
                    Ok(()) => None,
                    Err(e) => Some((Err(e.into()), None)),
                },
                Err(e) => Some((Err(e.into()), None)),
            }
        })
    }

    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(Box::pin(self.into_stream()))
    }
}
