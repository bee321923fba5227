//! 存储模块 - 过滤器缓存的本地持久化层
//!
//! - KvStore: sled 之上的分区键值存储
//! - VersionStore: 过滤器版本与值的领域 API（每个分区一个实例）
//! - Entities: FilterRecord 等实体定义

pub mod entities;
pub mod kv;
pub mod version_store;

pub use entities::{FilterRecord, StoreStatus};
pub use kv::{KvOp, KvStore};
pub use version_store::VersionStore;

/// KV 存储统计信息
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub key_count: u64,
    pub storage_size: u64,
}

/// 键前缀常量
pub mod keys {
    /// 完整记录（version + value）
    pub const FILTER_RECORD: &str = "filters_record:";
    /// 仅版本索引，用于不反序列化值的快速比较
    pub const FILTER_VERSION: &str = "filters_version:";
    /// 分区 schema 版本
    pub const SCHEMA_VERSION: &str = "__meta:schema_version";
}
