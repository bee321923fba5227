//! 存储实体定义

use serde::{Deserialize, Serialize};

/// 过滤器记录：名称、服务器确认的版本、不透明的值
///
/// version = 0 表示「已在本地登记但从未拉取过」。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl FilterRecord {
    /// 首次在本地出现时的占位记录
    pub fn seeded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            value: serde_json::Value::Null,
        }
    }

    pub fn new(name: impl Into<String>, version: u64, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            version,
            value,
        }
    }

    /// 是否已经从服务器拉取过值
    pub fn is_fetched(&self) -> bool {
        self.version > 0
    }
}

/// 存储可用状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// 正常可用
    Available,
    /// 可用，但分区 schema 版本不一致，等待清理
    EpochMismatch { stored: Option<u32>, expected: u32 },
    /// 宿主不支持持久化存储：始终从服务器拉取，不缓存
    Unavailable { reason: String },
}
