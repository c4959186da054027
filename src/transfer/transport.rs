//! Boundary interfaces implemented by driver code / 驱动实现的传输接口
//!
//! The engine never speaks a vendor wire format; drivers translate these
//! requests into their own API calls.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::hash::{HashAlgorithm, PartDigest};
use super::session::PartTarget;
use crate::error::{TransferError, TransferResult};

/// Upload session creation / 创建上传会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub part_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Server thinks the content may already exist / 预哈希匹配
    pub matched: bool,
    pub upload_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    /// Targets issued up front; empty when fetched lazily / 预先下发的上传地址
    #[serde(default)]
    pub targets: Vec<PartTarget>,
    #[serde(default)]
    pub expires_in: Option<Duration>,
}

/// Rapid-upload proof submission and multipart commit share one call
/// 秒传校验与分片提交共用一个接口
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub upload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<HashAlgorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_code: Option<String>,
    #[serde(default)]
    pub part_digests: Vec<PartDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub completed: bool,
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Fresh targets when a rapid-upload attempt falls back / 秒传失败时的上传地址
    #[serde(default)]
    pub targets: Vec<PartTarget>,
}

/// Part description sent when asking for (new) targets / 请求上传地址时的分片信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    pub part_number: u32,
    pub length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_base64: Option<String>,
}

#[async_trait]
pub trait NegotiationTransport: Send + Sync {
    async fn create(&self, req: &CreateRequest) -> TransferResult<CreateResponse>;

    async fn finalize(&self, req: &FinalizeRequest) -> TransferResult<FinalizeResponse>;

    /// Issue targets for `parts`, used for lazy fetching and renewal / 获取或刷新上传地址
    async fn refresh_targets(
        &self,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> TransferResult<Vec<PartTarget>>;
}

#[async_trait]
pub trait PartTransport: Send + Sync {
    /// PUT one part and return the HTTP status / 上传分片，返回状态码
    async fn put(&self, target: &PartTarget, data: Bytes) -> TransferResult<u16>;
}

/// Map a part PUT status onto the error taxonomy / 分片上传状态码分类
///
/// 2xx and 409 are success (a 409 means the part is already there).
pub fn classify_part_status(status: u16) -> TransferResult<()> {
    match status {
        200..=299 | 409 => Ok(()),
        403 => Err(TransferError::SessionExpired(format!(
            "part target rejected with status {}",
            status
        ))),
        408 | 429 | 500..=599 => Err(TransferError::Transient(format!(
            "part upload status {}",
            status
        ))),
        other => Err(TransferError::protocol(
            "unexpected part upload status",
            other.to_string(),
        )),
    }
}

/// One independently fetchable chunk of a remote object / 远端分片描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub length: u64,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Bytes are XORed with this key on the wire / 异或混淆密钥
    #[serde(default)]
    pub xor_key: Option<u8>,
}

impl ChunkDescriptor {
    /// Undo wire obfuscation / 还原异或混淆
    pub fn decode(&self, data: Bytes) -> Bytes {
        match self.xor_key {
            Some(key) if key != 0 => data.iter().map(|b| b ^ key).collect::<Vec<u8>>().into(),
            _ => data,
        }
    }
}

#[async_trait]
pub trait ChunkFetchTransport: Send + Sync {
    /// Raw (still obfuscated) chunk bytes / 获取分片原始数据
    async fn get(&self, descriptor: &ChunkDescriptor) -> TransferResult<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_status_mapping() {
        assert!(classify_part_status(200).is_ok());
        assert!(classify_part_status(409).is_ok());
        assert!(matches!(
            classify_part_status(403),
            Err(TransferError::SessionExpired(_))
        ));
        assert!(matches!(
            classify_part_status(503),
            Err(TransferError::Transient(_))
        ));
        assert!(matches!(
            classify_part_status(400),
            Err(TransferError::Protocol { .. })
        ));
    }

    #[test]
    fn test_xor_decode() {
        let d = ChunkDescriptor {
            index: 0,
            length: 3,
            url: String::new(),
            headers: vec![],
            xor_key: Some(0x5a),
        };
        let wire = Bytes::from(vec![b'a' ^ 0x5a, b'b' ^ 0x5a, b'c' ^ 0x5a]);
        assert_eq!(&d.decode(wire)[..], b"abc");

        let plain = ChunkDescriptor { xor_key: None, ..d };
        assert_eq!(&plain.decode(Bytes::from_static(b"abc"))[..], b"abc");
    }
}
