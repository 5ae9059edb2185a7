//! 错误类型
//!
//! 同步引擎内部错误一律向上传播（不在 BatchFetcher / merge 内吞掉），
//! 由嵌入方或 SyncScheduler 决定是否重试。

/// SDK 错误
#[derive(Debug, thiserror::Error)]
pub enum DocSyncError {
    /// 服务端响应格式非法（例如 `docs` 不是数组），本次调用致命失败，未修改任何本地状态
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for DocSyncError {
    fn from(error: serde_json::Error) -> Self {
        DocSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for DocSyncError {
    fn from(error: std::io::Error) -> Self {
        DocSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for DocSyncError {
    fn from(error: sled::Error) -> Self {
        DocSyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for DocSyncError {
    fn from(error: reqwest::Error) -> Self {
        DocSyncError::Transport(error.to_string())
    }
}

impl DocSyncError {
    /// 是否属于可重试的临时错误（网络层），格式错误等致命错误返回 false
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DocSyncError::Transport(_) | DocSyncError::NotConnected | DocSyncError::IO(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DocSyncError>;
