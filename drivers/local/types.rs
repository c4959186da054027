//! 本地分片存储数据类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::TransferConfig;

// ============ 目录布局 ============

/// Content blobs named by SHA-1 / 按 SHA-1 命名的内容文件
pub const OBJECTS_DIR: &str = "objects";
/// One JSON record per visible file / 文件记录
pub const TREE_DIR: &str = "tree";
/// In-progress uploads / 上传中的分片
pub const STAGING_DIR: &str = "staging";
/// pre-hash → candidate SHA-1 list / 预哈希索引
pub const PREHASH_DIR: &str = "prehash";

pub const UPLOAD_MANIFEST: &str = "upload.json";

pub const PART_URL_SCHEME: &str = "local://";
pub const BLOB_URL_SCHEME: &str = "blob://";
pub const EXPIRES_HEADER: &str = "x-expires-at";

// ============ 存储记录 ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub sha1: String,
    pub size: u64,
    pub modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedUpload {
    pub upload_id: String,
    pub path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub part_count: usize,
    #[serde(default)]
    pub pre_hash: Option<String>,
    pub created_at: String,
}

// ============ 驱动配置 ============

fn default_secret() -> String {
    "local-chunked".to_string()
}

fn default_download_chunk_size() -> u64 {
    4 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalChunkedOptions {
    pub root: PathBuf,
    /// Seeds the rapid-upload proof offset / 秒传校验密钥
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Issue part targets on demand instead of at create time / 按需下发上传地址
    #[serde(default)]
    pub lazy_targets: bool,
    /// Targets expire after this many seconds / 上传地址有效期
    #[serde(default)]
    pub target_ttl_secs: Option<u64>,
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size: u64,
    /// XOR key applied to served chunks / 下载分片异或密钥
    #[serde(default)]
    pub obfuscate_key: Option<u8>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub rapid_upload: Option<bool>,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl LocalChunkedOptions {
    /// Transfer settings with the flat overrides applied / 合并后的传输配置
    pub fn transfer_config(&self) -> Result<TransferConfig, String> {
        let mut config = self.transfer.clone();
        if let Some(v) = self.chunk_size {
            config.chunk_size_bytes = v;
        }
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.rapid_upload {
            config.rapid_upload = v;
        }
        config.normalized()
    }
}
