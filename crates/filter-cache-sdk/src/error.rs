use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterCacheError {
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    // 网络相关错误
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Push channel error: {0}")]
    PushChannel(String),
    // SDK 相关错误
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<sled::Error> for FilterCacheError {
    fn from(error: sled::Error) -> Self {
        FilterCacheError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for FilterCacheError {
    fn from(error: serde_json::Error) -> Self {
        FilterCacheError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FilterCacheError {
    fn from(error: std::io::Error) -> Self {
        FilterCacheError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for FilterCacheError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FilterCacheError::Timeout(error.to_string())
        } else if error.is_decode() {
            FilterCacheError::InvalidResponse(error.to_string())
        } else {
            FilterCacheError::Transport(error.to_string())
        }
    }
}

impl From<toml::de::Error> for FilterCacheError {
    fn from(error: toml::de::Error) -> Self {
        FilterCacheError::Config(error.to_string())
    }
}

impl FilterCacheError {
    /// 是否为可恢复错误（下一次触发会从头重试，UI 可显示“数据可能过期”）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FilterCacheError::Transport(_)
                | FilterCacheError::InvalidResponse(_)
                | FilterCacheError::Timeout(_)
                | FilterCacheError::PushChannel(_)
        )
    }

    /// 是否为存储层错误
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            FilterCacheError::KvStore(_) | FilterCacheError::StorageUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FilterCacheError>;
