//! Hash helpers: content digests, possession proof, integrity state
//! 哈希工具：内容摘要、秒传证明、完整性校验

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{TransferError, TransferResult};

/// Bytes in a proof-code window / 证明码窗口长度
pub const PROOF_WINDOW: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Md5 => Hasher::Md5(md5::Context::new()),
        }
    }

    /// One-shot lowercase hex digest / 一次性计算摘要
    pub fn digest_hex(&self, data: &[u8]) -> String {
        let mut h = self.hasher();
        h.update(data);
        h.finalize_hex()
    }
}

/// Incremental hasher over the supported algorithms / 增量哈希
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(md5::Context),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Md5(h) => h.consume(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.compute().0),
        }
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sha1(_) => "sha1",
            Self::Sha256(_) => "sha256",
            Self::Md5(_) => "md5",
        };
        f.debug_tuple("Hasher").field(&name).finish()
    }
}

/// SHA-1 of the content prefix, lowercase hex / 预哈希
pub fn pre_hash(prefix: &[u8]) -> String {
    HashAlgorithm::Sha1.digest_hex(prefix)
}

/// Byte window proving possession of the content / 秒传证明区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofRange {
    pub start: u64,
    pub end: u64,
}

impl ProofRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Offset = first 16 hex digits of md5(secret) as u64, modulo size.
/// Pure function of `(secret, size)`.
pub fn proof_range(secret: &str, size: u64) -> ProofRange {
    if size == 0 {
        return ProofRange { start: 0, end: 0 };
    }
    let digest = format!("{:x}", md5::compute(secret.as_bytes()));
    // 16 hex digits always fit in u64
    let value = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    let start = value % size;
    ProofRange {
        start,
        end: (start + PROOF_WINDOW).min(size),
    }
}

pub fn encode_proof(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Per-part MD5 in the two encodings drives ask for: upper hex for commit
/// lists, base64 for part target requests.
/// 分片MD5（大写十六进制 / base64）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDigest {
    pub part_number: u32,
    pub md5_hex: String,
    pub md5_base64: String,
}

impl PartDigest {
    pub fn compute(part_number: u32, data: &[u8]) -> Self {
        let digest = md5::compute(data);
        Self {
            part_number,
            md5_hex: format!("{:X}", digest),
            md5_base64: BASE64.encode(digest.as_ref()),
        }
    }
}

/// Aggregate slice digest: whole-file MD5 for single-part uploads, otherwise
/// MD5 over the upper-hex part digests joined by newlines.
/// 分片汇总摘要
pub fn slice_digest(parts: &[PartDigest]) -> String {
    match parts {
        [] => format!("{:X}", md5::compute(b"")),
        [only] => only.md5_hex.clone(),
        many => {
            let joined = many
                .iter()
                .map(|p| p.md5_hex.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            format!("{:X}", md5::compute(joined.as_bytes()))
        }
    }
}

/// Running digest over a download, finalized exactly once / 下载完整性状态
#[derive(Debug)]
pub struct IntegrityState {
    hasher: Option<Hasher>,
    expected: String,
}

impl IntegrityState {
    pub fn new(algorithm: HashAlgorithm, expected: impl Into<String>) -> Self {
        Self {
            hasher: Some(algorithm.hasher()),
            expected: expected.into().to_ascii_lowercase(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(h) = self.hasher.as_mut() {
            h.update(data);
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.hasher.is_none()
    }

    /// Compare the accumulated digest with the expected one / 校验
    pub fn finalize(&mut self) -> TransferResult<()> {
        let hasher = self
            .hasher
            .take()
            .ok_or_else(|| TransferError::protocol("integrity state finalized twice", ""))?;
        let actual = hasher.finalize_hex();
        if actual != self.expected {
            return Err(TransferError::IntegrityMismatch {
                expected: self.expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Drop the accumulator without checking (partial reads) / 放弃校验
    pub fn discard(&mut self) {
        self.hasher = None;
    }
}
