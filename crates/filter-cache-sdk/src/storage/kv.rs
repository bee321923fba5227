//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 按分区（partition）隔离的 Tree 命名空间
//! - JSON 编码的类型化读写
//! - 原子批量操作（写入与删除可混合在同一批次）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{FilterCacheError, Result};
use crate::storage::KvStats;

/// 批量操作中的单条指令
#[derive(Debug, Clone)]
pub enum KvOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvOp {
    /// 创建写入指令（值按 JSON 编码）
    pub fn put<V: Serialize>(key: impl Into<String>, value: &V) -> Result<Self> {
        let value = serde_json::to_vec(value)
            .map_err(|e| FilterCacheError::Serialization(format!("序列化值失败: {}", e)))?;
        Ok(KvOp::Put {
            key: key.into(),
            value,
        })
    }

    /// 创建删除指令
    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: Option<PathBuf>,
    /// 主数据库实例
    db: Arc<Db>,
    /// 分区专属的 Tree 实例
    partition_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例（数据位于 `{base_path}/kv`）
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FilterCacheError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 同一目录的旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FilterCacheError::StorageUnavailable(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path: Some(base_path),
            db: Arc::new(db),
            partition_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 创建临时 KV 存储（进程退出后删除，用于测试和无持久化场景）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FilterCacheError::StorageUnavailable(format!("打开临时数据库失败: {}", e)))?;
        Ok(Self {
            base_path: None,
            db: Arc::new(db),
            partition_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 数据目录（临时存储返回 None）
    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    fn tree_name(partition: &str) -> String {
        format!("partition_{}", partition)
    }

    /// 打开（或创建）分区 Tree，重复调用是幂等的
    pub async fn open_partition(&self, partition: &str) -> Result<()> {
        {
            let trees = self.partition_trees.read().await;
            if trees.contains_key(partition) {
                return Ok(());
            }
        }

        let tree = self
            .db
            .open_tree(Self::tree_name(partition))
            .map_err(|e| FilterCacheError::KvStore(format!("打开分区 Tree 失败: {}", e)))?;

        let mut trees = self.partition_trees.write().await;
        trees.insert(partition.to_string(), tree);

        tracing::info!("分区 KV Tree 初始化完成: {}", partition);
        Ok(())
    }

    /// 删除整个分区
    pub async fn drop_partition(&self, partition: &str) -> Result<()> {
        let mut trees = self.partition_trees.write().await;
        trees.remove(partition);

        self.db
            .drop_tree(Self::tree_name(partition))
            .map_err(|e| FilterCacheError::KvStore(format!("删除分区 Tree 失败: {}", e)))?;

        Ok(())
    }

    /// 获取分区 Tree
    async fn tree(&self, partition: &str) -> Result<Tree> {
        let trees = self.partition_trees.read().await;
        trees
            .get(partition)
            .cloned()
            .ok_or_else(|| FilterCacheError::KvStore(format!("分区 Tree 不存在: {}", partition)))
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, partition: &str, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.tree(partition).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FilterCacheError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| FilterCacheError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, partition: &str, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(partition).await?;

        let result = tree
            .get(key)
            .map_err(|e| FilterCacheError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| FilterCacheError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, partition: &str, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.tree(partition).await?;

        let result = tree
            .remove(key)
            .map_err(|e| FilterCacheError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.is_some())
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, partition: &str, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.tree(partition).await?;

        tree.contains_key(key)
            .map_err(|e| FilterCacheError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 原子批量执行写入/删除
    pub async fn apply_batch(&self, partition: &str, ops: Vec<KvOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let tree = self.tree(partition).await?;
        let mut batch = sled::Batch::default();

        for op in ops {
            match op {
                KvOp::Put { key, value } => batch.insert(key.as_bytes(), value),
                KvOp::Delete { key } => batch.remove(key.as_bytes()),
            }
        }

        tree.apply_batch(batch)
            .map_err(|e| FilterCacheError::KvStore(format!("批量操作失败: {}", e)))?;

        Ok(())
    }

    /// 获取指定前缀的所有原始键值对（值未解码，由调用方决定如何处理坏数据）
    pub async fn scan_prefix_raw(&self, partition: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree(partition).await?;
        let mut results = Vec::new();

        for result in tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| FilterCacheError::KvStore(format!("扫描前缀失败: {}", e)))?;
            results.push((key.to_vec(), value_bytes.to_vec()));
        }

        Ok(results)
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, partition: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let raw = self.scan_prefix_raw(partition, prefix).await?;
        let mut results = Vec::with_capacity(raw.len());

        for (key, value_bytes) in raw {
            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| FilterCacheError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key, value));
        }

        Ok(results)
    }

    /// 分区是否为空
    pub async fn is_empty(&self, partition: &str) -> Result<bool> {
        let tree = self.tree(partition).await?;
        Ok(tree.is_empty())
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FilterCacheError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取分区统计信息
    pub async fn get_stats(&self, partition: &str) -> Result<KvStats> {
        let tree = self.tree(partition).await?;

        let key_count = tree.len() as u64;
        let mut storage_size = 0u64;
        for entry in tree.iter() {
            let (key, value) = entry
                .map_err(|e| FilterCacheError::KvStore(format!("遍历键值对失败: {}", e)))?;
            storage_size += (key.len() + value.len()) as u64;
        }

        Ok(KvStats {
            key_count,
            storage_size,
        })
    }
}
