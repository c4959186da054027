//! Upload negotiation against a plain object server / 基于普通对象存储的上传协商
//!
//! Parts are PUT straight to `.uploads/{upload_id}/{n}`. Commit writes the
//! manifest next to the file path and then updates `index.json`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::types::{IndexEntry, Manifest, ManifestPart, INDEX_OBJECT, MANIFEST_SUFFIX, UPLOADS_PREFIX};
use crate::drivers::http::HttpTransport;
use crate::error::{TransferError, TransferResult};
use crate::transfer::{
    ChunkDescriptor, CreateRequest, CreateResponse, FinalizeRequest, FinalizeResponse,
    HashAlgorithm, NegotiationTransport, PartSpec, PartTarget,
};

pub struct ObjectServer {
    http: HttpTransport,
    base: String,
    auth: Vec<(String, String)>,
    pending: Mutex<HashMap<String, CreateRequest>>,
    // index.json is read-modify-write / 索引更新串行化
    index_lock: tokio::sync::Mutex<()>,
}

impl ObjectServer {
    pub fn new(http: HttpTransport, base: String, auth: Vec<(String, String)>) -> Self {
        Self {
            http,
            base,
            auth,
            pending: Mutex::new(HashMap::new()),
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn part_url(&self, upload_id: &str, part_number: u32) -> String {
        format!("{}/{}/{}/{}", self.base, UPLOADS_PREFIX, upload_id, part_number)
    }

    fn manifest_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base, path, MANIFEST_SUFFIX)
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base, INDEX_OBJECT)
    }

    fn targets(&self, upload_id: &str, parts: impl Iterator<Item = u32>) -> Vec<PartTarget> {
        parts
            .map(|n| PartTarget {
                part_number: n,
                url: self.part_url(upload_id, n),
                headers: self.auth.clone(),
            })
            .collect()
    }

    /// All committed files / 读取索引
    pub async fn index(&self) -> TransferResult<Vec<IndexEntry>> {
        match self.http.fetch(&self.index_url(), &self.auth).await? {
            Some(body) => serde_json::from_slice(&body)
                .map_err(|e| TransferError::protocol(format!("bad index: {}", e), String::from_utf8_lossy(&body))),
            None => Ok(vec![]),
        }
    }

    pub async fn manifest(&self, path: &str) -> TransferResult<Option<Manifest>> {
        let Some(body) = self.http.fetch(&self.manifest_url(path), &self.auth).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| TransferError::protocol(format!("bad manifest: {}", e), String::from_utf8_lossy(&body)))
    }

    /// Chunk descriptors in part order / 生成下载分片描述
    pub fn descriptors(&self, manifest: &Manifest) -> Vec<ChunkDescriptor> {
        manifest
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| ChunkDescriptor {
                index,
                length: part.length,
                url: self.part_url(&manifest.upload_id, part.part_number),
                headers: self.auth.clone(),
                xor_key: None,
            })
            .collect()
    }

    async fn publish(&self, manifest: &Manifest) -> TransferResult<()> {
        let body = serde_json::to_vec(manifest).map_err(|e| TransferError::protocol("manifest encode", e.to_string()))?;
        self.http.store(&self.manifest_url(&manifest.path), &self.auth, body).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.index().await?;
        index.retain(|e| e.path != manifest.path);
        index.push(IndexEntry {
            path: manifest.path.clone(),
            size: manifest.size,
            modified: manifest.modified.clone(),
        });
        index.sort_by(|a, b| a.path.cmp(&b.path));
        let body = serde_json::to_vec(&index).map_err(|e| TransferError::protocol("index encode", e.to_string()))?;
        self.http.store(&self.index_url(), &self.auth, body).await
    }
}

/// Part `n` (1-based) of a plan with fixed `chunk_size` / 分片长度
fn part_length(req: &CreateRequest, part_number: u32) -> u64 {
    let start = u64::from(part_number.saturating_sub(1)) * req.chunk_size;
    req.chunk_size.min(req.size.saturating_sub(start))
}

#[async_trait]
impl NegotiationTransport for ObjectServer {
    async fn create(&self, req: &CreateRequest) -> TransferResult<CreateResponse> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let count = u32::try_from(req.part_count)
            .map_err(|_| TransferError::InvalidPlan(format!("{} parts", req.part_count)))?;
        let targets = self.targets(&upload_id, 1..=count);
        self.pending.lock().insert(upload_id.clone(), req.clone());
        tracing::debug!("http_chunked upload {} created for {}", upload_id, req.path);
        Ok(CreateResponse {
            matched: false,
            upload_id,
            file_id: Some(req.path.clone()),
            targets,
            expires_in: None,
        })
    }

    async fn finalize(&self, req: &FinalizeRequest) -> TransferResult<FinalizeResponse> {
        // No content index on the server side / 不支持秒传
        if req.proof_code.is_some() {
            return Ok(FinalizeResponse { completed: false, remote_id: None, targets: vec![] });
        }
        let created = self
            .pending
            .lock()
            .remove(&req.upload_id)
            .ok_or_else(|| TransferError::protocol("unknown upload", req.upload_id.clone()))?;

        let parts = req
            .part_digests
            .iter()
            .map(|d| ManifestPart {
                part_number: d.part_number,
                length: part_length(&created, d.part_number),
                md5_hex: d.md5_hex.clone(),
            })
            .collect();
        let sha1 = match req.hash_algorithm {
            Some(HashAlgorithm::Sha1) => req.full_hash.clone(),
            _ => None,
        };
        let manifest = Manifest {
            path: created.path.clone(),
            upload_id: req.upload_id.clone(),
            size: created.size,
            sha1,
            parts,
            modified: chrono::Utc::now().to_rfc3339(),
        };
        self.publish(&manifest).await?;
        tracing::info!("http_chunked committed {} ({} parts)", manifest.path, manifest.parts.len());

        Ok(FinalizeResponse {
            completed: true,
            remote_id: Some(created.path),
            targets: vec![],
        })
    }

    async fn refresh_targets(&self, upload_id: &str, parts: &[PartSpec]) -> TransferResult<Vec<PartTarget>> {
        if !self.pending.lock().contains_key(upload_id) {
            return Err(TransferError::protocol("unknown upload", upload_id));
        }
        Ok(self.targets(upload_id, parts.iter().map(|p| p.part_number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_lengths_cover_the_file() {
        let req = CreateRequest {
            path: "/a".into(),
            size: 250,
            chunk_size: 100,
            part_count: 3,
            pre_hash: None,
        };
        assert_eq!(part_length(&req, 1), 100);
        assert_eq!(part_length(&req, 3), 50);
        assert_eq!(part_length(&req, 4), 0);
    }
}
