//! Transfer error taxonomy / 传输错误分类
//!
//! Only `Transient` and `SessionExpired` are recovered locally
//! (retry / renewal). Everything else propagates to the caller untouched.
//! 只有临时网络错误和会话过期会在本地恢复，其余错误原样返回给调用方。

use thiserror::Error;

pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Network hiccup, retried by `RetryPolicy` / 临时网络错误
    #[error("transient network error: {0}")]
    Transient(String),

    /// Upload targets or credentials expired / 上传地址或凭证过期
    #[error("upload session expired: {0}")]
    SessionExpired(String),

    /// Downloaded or uploaded bytes do not match the declared digest / 校验不一致
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    /// Unexpected response shape; payload kept for diagnosis / 响应格式异常
    #[error("protocol error: {message} (payload: {payload})")]
    Protocol { message: String, payload: String },

    #[error("invalid transfer plan: {0}")]
    InvalidPlan(String),

    #[error("reader already closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn protocol(message: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            payload: payload.into(),
        }
    }

    /// Whether `RetryPolicy` may attempt the operation again / 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::SessionExpired(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<TransferError> for std::io::Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => e,
            TransferError::Cancelled => std::io::Error::new(std::io::ErrorKind::Interrupted, err),
            TransferError::IntegrityMismatch { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
