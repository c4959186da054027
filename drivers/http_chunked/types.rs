//! HTTP 分片对象存储数据类型

use serde::{Deserialize, Serialize};

use crate::config::TransferConfig;

/// Listing of every committed file, kept at `{root}/index.json` / 文件索引
pub const INDEX_OBJECT: &str = "index.json";
/// Part bodies live under `{root}/.uploads/{upload_id}/{n}` / 分片目录
pub const UPLOADS_PREFIX: &str = ".uploads";
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub size: u64,
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPart {
    pub part_number: u32,
    pub length: u64,
    pub md5_hex: String,
}

/// Committed file: which parts to read back, in order / 文件清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub path: String,
    pub upload_id: String,
    pub size: u64,
    #[serde(default)]
    pub sha1: Option<String>,
    pub parts: Vec<ManifestPart>,
    pub modified: String,
}

// ============ 驱动配置 ============

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpChunkedOptions {
    /// Server base URL / 服务器地址
    pub address: String,
    #[serde(default)]
    pub root_path: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl HttpChunkedOptions {
    /// Plain object servers cannot dedup, so rapid upload is off and the
    /// whole-file SHA-1 is computed up front for read verification.
    /// 关闭秒传并在上传前计算全量哈希
    pub fn transfer_config(&self) -> Result<TransferConfig, String> {
        let mut config = self.transfer.clone();
        if let Some(v) = self.chunk_size {
            config.chunk_size_bytes = v;
        }
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        config.rapid_upload = false;
        config.full_hash_on_upload = true;
        config.normalized()
    }

    /// `{address}/{root_path}` without a trailing slash / 基础地址
    pub fn base_url(&self) -> String {
        let base = self.address.trim_end_matches('/');
        let root = self.root_path.trim_matches('/');
        if root.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, root)
        }
    }

    /// Basic auth header, none without a username / 认证头
    pub fn auth_headers(&self) -> Vec<(String, String)> {
        use base64::Engine;
        if self.username.is_empty() {
            return vec![];
        }
        let credentials = format!("{}:{}", self.username, self.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        vec![("Authorization".to_string(), format!("Basic {}", encoded))]
    }
}
