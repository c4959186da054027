//! Transfer configuration module / 传输配置模块
//!
//! Loaded from a JSON file; a default file is created on first run.
//! 首次运行时创建默认配置文件

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transfer::planner::{ChunkGrowth, PlanConstraints};
use crate::transfer::retry::{Backoff, RetryPolicy};

const MIB: u64 = 1024 * 1024;

/// Transfer engine configuration / 传输引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Default (minimum) chunk size in bytes / 默认分片大小
    pub chunk_size_bytes: u64,
    /// Upper bound on the number of parts / 最大分片数量
    pub max_chunk_count: usize,
    /// Upper bound on a single part / 单个分片最大大小
    pub max_chunk_size: u64,
    /// Use the vendor part-size ladder instead of doubling / 使用分片阶梯
    pub use_size_ladder: bool,
    /// Parallel part uploads, 1..=32 / 并发上传数
    pub concurrency: usize,
    /// Attempts per part / chunk fetch / 重试次数
    pub retry_attempts: u32,
    /// Delay between attempts (milliseconds) / 重试间隔
    pub retry_delay_ms: u64,
    /// Double the delay after each failed attempt / 指数退避
    pub retry_backoff: bool,
    /// Renew part targets after this many seconds / 上传地址刷新窗口
    pub session_renewal_window_secs: u64,
    /// Try content-addressed rapid upload / 启用秒传
    pub rapid_upload: bool,
    /// Files at or below this size skip rapid upload / 秒传最小文件大小
    pub rapid_upload_min_size: u64,
    /// Prefix length for the pre-hash / 预哈希长度
    pub pre_hash_bytes: usize,
    /// Hash the whole file before a normal upload so commit can carry it
    /// 普通上传前计算全量哈希
    pub full_hash_on_upload: bool,
    /// Temporary directory for spooling non-seekable sources / 临时目录
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 10 * MIB,
            max_chunk_count: 10_000,
            max_chunk_size: 5 * 1024 * MIB,
            use_size_ladder: false,
            concurrency: 3,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            retry_backoff: true,
            session_renewal_window_secs: 50 * 60,
            rapid_upload: true,
            rapid_upload_min_size: 100 * 1024,
            pre_hash_bytes: 1024,
            full_hash_on_upload: false,
            temp_dir: None,
        }
    }
}

impl TransferConfig {
    /// Clamp values into their legal ranges / 规范化配置
    pub fn normalized(mut self) -> Result<Self, String> {
        if self.max_chunk_count == 0 {
            return Err("max_chunk_count must be greater than 0".to_string());
        }
        if self.chunk_size_bytes == 0 {
            return Err("chunk_size_bytes must be greater than 0".to_string());
        }
        if self.max_chunk_size < self.chunk_size_bytes {
            tracing::warn!(
                "max_chunk_size {} below chunk_size_bytes {}, raising it",
                self.max_chunk_size,
                self.chunk_size_bytes
            );
            self.max_chunk_size = self.chunk_size_bytes;
        }
        self.concurrency = self.concurrency.clamp(1, 32);
        self.retry_attempts = self.retry_attempts.max(1);
        Ok(self)
    }

    pub fn plan_constraints(&self) -> PlanConstraints {
        PlanConstraints {
            min_chunk: self.chunk_size_bytes,
            max_chunk_size: self.max_chunk_size,
            max_chunk_count: self.max_chunk_count,
            growth: if self.use_size_ladder {
                ChunkGrowth::ladder()
            } else {
                ChunkGrowth::Doubling
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.retry_backoff {
            Backoff::Exponential
        } else {
            Backoff::Fixed
        };
        RetryPolicy::new(self.retry_attempts, self.retry_delay(), backoff)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn renewal_window(&self) -> Duration {
        Duration::from_secs(self.session_renewal_window_secs)
    }
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config(path: &Path) -> Result<TransferConfig, String> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: TransferConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", path);
        config.normalized()
    } else {
        let config = TransferConfig::default();
        save_config(path, &config)?;
        tracing::info!("Created default configuration at {:?}", path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(path: &Path, config: &TransferConfig) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_clamps_concurrency() {
        let cfg = TransferConfig {
            concurrency: 100,
            retry_attempts: 0,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(cfg.concurrency, 32);
        assert_eq!(cfg.retry_attempts, 1);

        let cfg = TransferConfig {
            concurrency: 0,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(cfg.concurrency, 1);
    }

    #[test]
    fn test_normalize_rejects_zero_count() {
        let cfg = TransferConfig {
            max_chunk_count: 0,
            ..Default::default()
        };
        assert!(cfg.normalized().is_err());
    }

    #[test]
    fn test_load_creates_default_then_reads_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");

        let created = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.chunk_size_bytes, 10 * MIB);

        // Missing keys fall back to defaults / 缺失字段使用默认值
        std::fs::write(&path, r#"{"concurrency": 8, "rapid_upload": false}"#).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.concurrency, 8);
        assert!(!loaded.rapid_upload);
        assert_eq!(loaded.retry_attempts, 3);
        assert_eq!(loaded.renewal_window(), Duration::from_secs(3000));
    }
}
