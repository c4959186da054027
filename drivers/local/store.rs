//! 本地内容寻址分片存储
//!
//! Plays the server side of every transfer transport: upload sessions are
//! staged under `staging/<upload_id>`, committed blobs live under
//! `objects/<sha1>`, and `prehash/` answers rapid-upload lookups.

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::types::*;
use crate::error::{TransferError, TransferResult};
use crate::storage::Entry;
use crate::transfer::hash::{encode_proof, pre_hash, proof_range, slice_digest};
use crate::transfer::{
    ChunkDescriptor, ChunkFetchTransport, CreateRequest, CreateResponse, FinalizeRequest,
    FinalizeResponse, HashAlgorithm, NegotiationTransport, PartDigest, PartSpec, PartTarget,
    PartTransport,
};

pub struct ChunkStore {
    root: PathBuf,
    secret: String,
    lazy_targets: bool,
    target_ttl: Option<Duration>,
    obfuscate_key: Option<u8>,
    /// Prefix length the dedup index is keyed by, shared with the client
    /// 预哈希长度（与客户端配置一致）
    pre_hash_bytes: usize,
}

impl ChunkStore {
    /// Open (and lay out) a store under `root` / 打开存储目录
    pub fn open(options: &LocalChunkedOptions) -> std::io::Result<Self> {
        for dir in [OBJECTS_DIR, TREE_DIR, STAGING_DIR, PREHASH_DIR] {
            std::fs::create_dir_all(options.root.join(dir))?;
        }
        Ok(Self {
            root: options.root.clone(),
            secret: options.secret.clone(),
            lazy_targets: options.lazy_targets,
            target_ttl: options.target_ttl_secs.map(Duration::from_secs),
            obfuscate_key: options.obfuscate_key.filter(|k| *k != 0),
            pre_hash_bytes: options.transfer.pre_hash_bytes,
        })
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Normalized path segments, rejecting traversal / 规范化路径
    fn segments(path: &str) -> TransferResult<Vec<String>> {
        let path = path.replace('\\', "/");
        let mut out = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(TransferError::protocol(
                        "Access path exceeds root directory scope",
                        path.clone(),
                    ))
                }
                p => out.push(p.to_string()),
            }
        }
        Ok(out)
    }

    fn tree_path(&self, path: &str) -> TransferResult<PathBuf> {
        let mut full = self.root.join(TREE_DIR);
        for seg in Self::segments(path)? {
            full.push(seg);
        }
        Ok(full)
    }

    fn object_path(&self, sha1: &str) -> TransferResult<PathBuf> {
        if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TransferError::protocol("invalid object id", sha1));
        }
        Ok(self.root.join(OBJECTS_DIR).join(sha1.to_ascii_lowercase()))
    }

    fn staging_dir(&self, upload_id: &str) -> TransferResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(TransferError::protocol("invalid upload id", upload_id));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    async fn load_upload(&self, upload_id: &str) -> TransferResult<StagedUpload> {
        let manifest = self.staging_dir(upload_id)?.join(UPLOAD_MANIFEST);
        let raw = match tokio::fs::read(&manifest).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::protocol("unknown upload id", upload_id));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| TransferError::protocol("corrupt upload manifest", e.to_string()))
    }

    /// Look up the record of a committed file / 查询文件记录
    pub async fn lookup(&self, path: &str) -> TransferResult<Option<FileRecord>> {
        let file = self.tree_path(path)?;
        match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Ok(None),
        }
        let raw = tokio::fs::read(&file).await?;
        let record = serde_json::from_slice(&raw)
            .map_err(|e| TransferError::protocol("corrupt file record", e.to_string()))?;
        Ok(Some(record))
    }

    pub async fn list(&self, path: &str) -> anyhow::Result<Vec<Entry>> {
        let dir = self.tree_path(path)?;
        let base = crate::utils::fix_and_clean_path(path);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut result = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let child = if base == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", base, name)
            };
            if entry.metadata().await?.is_dir() {
                result.push(Entry { name, path: child, is_dir: true, size: 0, modified: None });
            } else if let Some(record) = self.lookup(&child).await? {
                result.push(Entry {
                    name,
                    path: child,
                    is_dir: false,
                    size: record.size,
                    modified: Some(record.modified),
                });
            }
        }
        result.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(result)
    }

    fn targets(&self, upload_id: &str, parts: impl Iterator<Item = u32>) -> Vec<PartTarget> {
        let headers = match self.target_ttl {
            Some(ttl) => {
                let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
                vec![(EXPIRES_HEADER.to_string(), expires_at.timestamp_millis().to_string())]
            }
            None => vec![],
        };
        parts
            .map(|n| PartTarget {
                part_number: n,
                url: format!("{}{}/{}", PART_URL_SCHEME, upload_id, n),
                headers: headers.clone(),
            })
            .collect()
    }

    /// Chunk layout used for downloads / 下载分片布局
    pub fn descriptors(&self, record: &FileRecord, chunk_size: u64) -> Vec<ChunkDescriptor> {
        let chunk_size = chunk_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset < record.size {
            let length = chunk_size.min(record.size - offset);
            out.push(ChunkDescriptor {
                index: out.len(),
                length,
                url: format!("{}{}/{}", BLOB_URL_SCHEME, record.sha1, offset),
                headers: vec![],
                xor_key: self.obfuscate_key,
            });
            offset += length;
        }
        out
    }

    async fn prehash_candidates(&self, pre_hash: &str) -> Vec<String> {
        if !pre_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return vec![];
        }
        match tokio::fs::read_to_string(self.root.join(PREHASH_DIR).join(pre_hash)).await {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => vec![],
        }
    }

    async fn index_prehash(&self, pre_hash: &str, sha1: &str) -> TransferResult<()> {
        if self.prehash_candidates(pre_hash).await.iter().any(|c| c == sha1) {
            return Ok(());
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(PREHASH_DIR).join(pre_hash))
            .await?;
        f.write_all(format!("{}\n", sha1).as_bytes()).await?;
        Ok(())
    }

    async fn record_file(&self, path: &str, sha1: &str, size: u64) -> TransferResult<()> {
        let file = self.tree_path(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = FileRecord {
            sha1: sha1.to_string(),
            size,
            modified: chrono::Utc::now().to_rfc3339(),
        };
        let raw = serde_json::to_vec_pretty(&record)
            .map_err(|e| TransferError::protocol("cannot encode file record", e.to_string()))?;
        tokio::fs::write(&file, raw).await?;
        tracing::info!("stored {} -> {} ({} bytes)", path, sha1, size);
        Ok(())
    }

    async fn read_object(&self, sha1: &str, offset: u64, len: u64) -> TransferResult<Vec<u8>> {
        let mut f = tokio::fs::File::open(self.object_path(sha1)?).await?;
        f.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Check a rapid-upload claim / 校验秒传请求
    async fn verify_possession(&self, staged: &StagedUpload, req: &FinalizeRequest) -> TransferResult<Option<String>> {
        let (Some(full_hash), Some(proof)) = (&req.full_hash, &req.proof_code) else {
            return Ok(None);
        };
        if req.hash_algorithm.unwrap_or(HashAlgorithm::Sha1) != HashAlgorithm::Sha1 {
            return Ok(None);
        }
        let full_hash = full_hash.to_ascii_lowercase();
        let object = self.object_path(&full_hash)?;
        match tokio::fs::metadata(&object).await {
            Ok(meta) if meta.len() == staged.size => {}
            _ => return Ok(None),
        }
        let range = proof_range(&self.secret, staged.size);
        let window = self.read_object(&full_hash, range.start, range.len()).await?;
        if encode_proof(&window) != *proof {
            tracing::warn!("rapid upload proof rejected for {}", staged.path);
            return Ok(None);
        }
        Ok(Some(full_hash))
    }

    /// Assemble staged parts into a blob / 合并分片
    async fn assemble(&self, staged: &StagedUpload, req: &FinalizeRequest) -> TransferResult<String> {
        let dir = self.staging_dir(&staged.upload_id)?;
        if req.part_digests.len() != staged.part_count {
            return Err(TransferError::protocol(
                "part list does not match upload",
                format!("declared={}, expected={}", req.part_digests.len(), staged.part_count),
            ));
        }

        let tmp = self.root.join(OBJECTS_DIR).join(format!(".tmp-{}", staged.upload_id));
        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut sha1 = Sha1::new();
        let mut head: Vec<u8> = Vec::with_capacity(self.pre_hash_bytes);
        let mut digests = Vec::with_capacity(staged.part_count);
        let mut total = 0u64;

        for (i, declared) in req.part_digests.iter().enumerate() {
            let part_number = i as u32 + 1;
            let data = match tokio::fs::read(dir.join(format!("{}.part", part_number))).await {
                Ok(d) => d,
                Err(_) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(TransferError::protocol(
                        "part missing at commit",
                        format!("part_number={}", part_number),
                    ));
                }
            };
            let actual = PartDigest::compute(part_number, &data);
            if declared.part_number != part_number || !actual.md5_hex.eq_ignore_ascii_case(&declared.md5_hex) {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(TransferError::IntegrityMismatch {
                    expected: declared.md5_hex.clone(),
                    actual: actual.md5_hex,
                });
            }
            if head.len() < self.pre_hash_bytes {
                let take = (self.pre_hash_bytes - head.len()).min(data.len());
                head.extend_from_slice(&data[..take]);
            }
            sha1.update(&data);
            out.write_all(&data).await?;
            total += data.len() as u64;
            digests.push(actual);
        }
        out.flush().await?;
        drop(out);

        let mismatch = |expected: String, actual: String| TransferError::IntegrityMismatch { expected, actual };
        if total != staged.size {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(mismatch(format!("{} bytes", staged.size), format!("{} bytes", total)));
        }
        if let Some(declared) = &req.slice_digest {
            let actual = slice_digest(&digests);
            if !actual.eq_ignore_ascii_case(declared) {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(mismatch(declared.clone(), actual));
            }
        }
        let sha1 = hex::encode(sha1.finalize());
        if let Some(declared) = &req.full_hash {
            if !declared.eq_ignore_ascii_case(&sha1) {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(mismatch(declared.to_ascii_lowercase(), sha1));
            }
        }

        let object = self.object_path(&sha1)?;
        if tokio::fs::metadata(&object).await.is_ok() {
            tokio::fs::remove_file(&tmp).await?;
        } else {
            tokio::fs::rename(&tmp, &object).await?;
        }
        self.index_prehash(&pre_hash(&head), &sha1).await?;
        Ok(sha1)
    }

    fn parse_part_url(url: &str) -> Option<(&str, u32)> {
        let rest = url.strip_prefix(PART_URL_SCHEME)?;
        let (upload_id, part) = rest.split_once('/')?;
        Some((upload_id, part.parse().ok()?))
    }

    fn parse_blob_url(url: &str) -> Option<(&str, u64)> {
        let rest = url.strip_prefix(BLOB_URL_SCHEME)?;
        let (sha1, offset) = rest.split_once('/')?;
        Some((sha1, offset.parse().ok()?))
    }
}

fn expired(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .find(|(k, _)| k == EXPIRES_HEADER)
        .and_then(|(_, v)| v.parse::<i64>().ok())
        .map_or(false, |at| chrono::Utc::now().timestamp_millis() >= at)
}

#[async_trait]
impl NegotiationTransport for ChunkStore {
    async fn create(&self, req: &CreateRequest) -> TransferResult<CreateResponse> {
        let path = crate::utils::fix_and_clean_path(&req.path);
        if path == "/" {
            return Err(TransferError::protocol("cannot upload to root", path));
        }
        if tokio::fs::metadata(self.tree_path(&path)?).await.map_or(false, |m| m.is_dir()) {
            return Err(TransferError::protocol("path is a directory", path));
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        let staged = StagedUpload {
            upload_id: upload_id.clone(),
            path: path.clone(),
            size: req.size,
            chunk_size: req.chunk_size,
            part_count: req.part_count,
            pre_hash: req.pre_hash.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let dir = self.staging_dir(&upload_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let raw = serde_json::to_vec(&staged)
            .map_err(|e| TransferError::protocol("cannot encode upload manifest", e.to_string()))?;
        tokio::fs::write(dir.join(UPLOAD_MANIFEST), raw).await?;

        let matched = match &req.pre_hash {
            Some(h) => !self.prehash_candidates(&h.to_ascii_lowercase()).await.is_empty(),
            None => false,
        };
        let targets = if self.lazy_targets {
            vec![]
        } else {
            self.targets(&upload_id, 1..=req.part_count as u32)
        };
        tracing::debug!("upload {} created for {} ({} parts, matched={})", upload_id, path, req.part_count, matched);

        Ok(CreateResponse {
            matched,
            upload_id,
            file_id: Some(path),
            targets,
            expires_in: self.target_ttl,
        })
    }

    async fn finalize(&self, req: &FinalizeRequest) -> TransferResult<FinalizeResponse> {
        let staged = self.load_upload(&req.upload_id).await?;
        let dir = self.staging_dir(&staged.upload_id)?;

        let sha1 = if req.proof_code.is_some() {
            match self.verify_possession(&staged, req).await? {
                Some(sha1) => {
                    tracing::info!("rapid upload hit for {}", staged.path);
                    sha1
                }
                None => {
                    let targets = if self.lazy_targets {
                        vec![]
                    } else {
                        self.targets(&staged.upload_id, 1..=staged.part_count as u32)
                    };
                    return Ok(FinalizeResponse { completed: false, remote_id: None, targets });
                }
            }
        } else {
            self.assemble(&staged, req).await?
        };

        self.record_file(&staged.path, &sha1, staged.size).await?;
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(FinalizeResponse {
            completed: true,
            remote_id: Some(staged.path),
            targets: vec![],
        })
    }

    async fn refresh_targets(&self, upload_id: &str, parts: &[PartSpec]) -> TransferResult<Vec<PartTarget>> {
        let staged = self.load_upload(upload_id).await?;
        if let Some(bad) = parts.iter().find(|p| p.part_number == 0 || p.part_number as usize > staged.part_count) {
            return Err(TransferError::protocol(
                "part number out of range",
                format!("part_number={}, part_count={}", bad.part_number, staged.part_count),
            ));
        }
        Ok(self.targets(upload_id, parts.iter().map(|p| p.part_number)))
    }
}

#[async_trait]
impl PartTransport for ChunkStore {
    async fn put(&self, target: &PartTarget, data: Bytes) -> TransferResult<u16> {
        let Some((upload_id, part_number)) = Self::parse_part_url(&target.url) else {
            return Ok(400);
        };
        if expired(&target.headers) {
            return Ok(403);
        }
        let dir = self.staging_dir(upload_id)?;
        if tokio::fs::metadata(dir.join(UPLOAD_MANIFEST)).await.is_err() {
            return Ok(404);
        }

        let part = dir.join(format!("{}.part", part_number));
        if let Ok(existing) = tokio::fs::read(&part).await {
            if existing == data.as_ref() {
                return Ok(409);
            }
        }
        write_atomic(&part, &data).await?;
        Ok(201)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("partial");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl ChunkFetchTransport for ChunkStore {
    async fn get(&self, descriptor: &ChunkDescriptor) -> TransferResult<Bytes> {
        let (sha1, offset) = Self::parse_blob_url(&descriptor.url)
            .ok_or_else(|| TransferError::protocol("malformed chunk url", descriptor.url.clone()))?;
        let mut data = self.read_object(sha1, offset, descriptor.length).await?;
        if let Some(key) = self.obfuscate_key {
            data.iter_mut().for_each(|b| *b ^= key);
        }
        Ok(Bytes::from(data))
    }
}
