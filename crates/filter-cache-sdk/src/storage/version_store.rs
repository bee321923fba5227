//! 过滤器版本存储
//!
//! 每个分区保存两类键：
//! - `filters_record:{name}` → 完整 FilterRecord（version + value）
//! - `filters_version:{name}` → 仅版本号，供同步器快速比较
//!
//! 两类键总是在同一个 sled 批次中写入，读方不会看到「版本已更新而值未更新」的中间状态。
//! 存储不可用时所有读返回空、所有写为空操作，调用方退化为「每次都从服务器拉取」。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{FilterCacheError, Result};
use crate::storage::entities::{FilterRecord, StoreStatus};
use crate::storage::kv::{KvOp, KvStore};
use crate::storage::{keys, KvStats};
use crate::version::STORE_SCHEMA_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Epoch {
    Current,
    Mismatch { stored: Option<u32> },
}

/// 分区级过滤器版本存储
#[derive(Debug)]
pub struct VersionStore {
    partition: String,
    kv: Option<Arc<KvStore>>,
    unavailable_reason: Option<String>,
    epoch: RwLock<Epoch>,
}

fn record_key(name: &str) -> String {
    format!("{}{}", keys::FILTER_RECORD, name)
}

fn version_key(name: &str) -> String {
    format!("{}{}", keys::FILTER_VERSION, name)
}

fn validate_partition(partition: &str) -> Result<()> {
    if partition.trim().is_empty() {
        return Err(FilterCacheError::InvalidArgument(
            "partition key 不能为空".to_string(),
        ));
    }
    Ok(())
}

impl VersionStore {
    /// 打开数据目录下的分区存储；存储引擎不可用时返回不可用模式的实例
    pub async fn open(data_dir: &Path, partition: &str) -> Result<Self> {
        validate_partition(partition)?;

        match KvStore::new(data_dir).await {
            Ok(kv) => match Self::initialize(Arc::new(kv), partition).await {
                Ok(store) => Ok(store),
                Err(e) => Ok(Self::unavailable(partition, e.to_string())),
            },
            Err(e) => Ok(Self::unavailable(partition, e.to_string())),
        }
    }

    /// 在已有 KvStore 上初始化分区（同一 KvStore 上重复调用是幂等的）
    pub async fn initialize(kv: Arc<KvStore>, partition: &str) -> Result<Self> {
        validate_partition(partition)?;
        kv.open_partition(partition).await?;

        let stored = match kv.get::<_, u32>(partition, keys::SCHEMA_VERSION).await {
            Ok(v) => v,
            Err(e) => {
                warn!("读取分区 schema 版本失败，按版本缺失处理: partition={}, error={}", partition, e);
                None
            }
        };

        let epoch = match stored {
            Some(v) if v == STORE_SCHEMA_VERSION => Epoch::Current,
            None if kv.is_empty(partition).await? => {
                kv.set(partition, keys::SCHEMA_VERSION, &STORE_SCHEMA_VERSION).await?;
                Epoch::Current
            }
            other => {
                warn!(
                    "分区 schema 版本不一致，等待清理: partition={}, stored={:?}, expected={}",
                    partition, other, STORE_SCHEMA_VERSION
                );
                Epoch::Mismatch { stored: other }
            }
        };

        info!("✅ VersionStore 初始化完成: partition={}", partition);

        Ok(Self {
            partition: partition.to_string(),
            kv: Some(kv),
            unavailable_reason: None,
            epoch: RwLock::new(epoch),
        })
    }

    /// 不可用模式：所有读返回空，所有写为空操作
    pub fn unavailable(partition: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("⚠️ 本地存储不可用，退化为始终从服务器拉取: partition={}, reason={}", partition, reason);
        Self {
            partition: partition.to_string(),
            kv: None,
            unavailable_reason: Some(reason),
            epoch: RwLock::new(Epoch::Current),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn is_available(&self) -> bool {
        self.kv.is_some()
    }

    pub fn status(&self) -> StoreStatus {
        if let Some(reason) = &self.unavailable_reason {
            return StoreStatus::Unavailable {
                reason: reason.clone(),
            };
        }
        match *self.epoch.read() {
            Epoch::Current => StoreStatus::Available,
            Epoch::Mismatch { stored } => StoreStatus::EpochMismatch {
                stored,
                expected: STORE_SCHEMA_VERSION,
            },
        }
    }

    /// 分区 schema 版本不一致，需要先执行过期条目清理
    pub fn needs_cleanup(&self) -> bool {
        matches!(*self.epoch.read(), Epoch::Mismatch { .. })
    }

    /// 清理完成后写入当前 schema 版本
    pub async fn complete_epoch_migration(&self) -> Result<()> {
        let Some(kv) = &self.kv else { return Ok(()) };
        kv.set(&self.partition, keys::SCHEMA_VERSION, &STORE_SCHEMA_VERSION).await?;
        *self.epoch.write() = Epoch::Current;
        info!("分区 schema 版本已更新: partition={}, version={}", self.partition, STORE_SCHEMA_VERSION);
        Ok(())
    }

    /// 点查完整记录
    pub async fn get(&self, name: &str) -> Result<Option<FilterRecord>> {
        let Some(kv) = &self.kv else { return Ok(None) };
        kv.get(&self.partition, record_key(name)).await
    }

    /// 仅查询版本号
    pub async fn get_version(&self, name: &str) -> Result<Option<u64>> {
        let Some(kv) = &self.kv else { return Ok(None) };
        kv.get(&self.partition, version_key(name)).await
    }

    /// 原子写入 version + value
    pub async fn upsert(&self, record: &FilterRecord) -> Result<()> {
        let Some(kv) = &self.kv else { return Ok(()) };
        let ops = vec![
            KvOp::put(record_key(&record.name), record)?,
            KvOp::put(version_key(&record.name), &record.version)?,
        ];
        kv.apply_batch(&self.partition, ops).await?;
        debug!(
            "记录已写入: partition={}, name={}, version={}",
            self.partition, record.name, record.version
        );
        Ok(())
    }

    /// 仅更新版本号（记录不存在时以空值创建）
    pub async fn set_version(&self, name: &str, version: u64) -> Result<()> {
        if !self.is_available() {
            return Ok(());
        }
        let mut record = self
            .get(name)
            .await?
            .unwrap_or_else(|| FilterRecord::seeded(name));
        record.version = version;
        self.upsert(&record).await
    }

    /// 仅更新值（记录不存在时以 version 0 创建）
    pub async fn set_value(&self, name: &str, value: serde_json::Value) -> Result<()> {
        if !self.is_available() {
            return Ok(());
        }
        let mut record = self
            .get(name)
            .await?
            .unwrap_or_else(|| FilterRecord::seeded(name));
        record.value = value;
        self.upsert(&record).await
    }

    /// 首次出现的过滤器以 version 0 登记，已有可解析的记录时返回 false
    ///
    /// 只有版本索引、记录缺失或无法解析的条目会被重置为 version 0。
    pub async fn seed(&self, name: &str) -> Result<bool> {
        if !self.is_available() {
            return Ok(false);
        }
        match self.get(name).await {
            Ok(Some(_)) => return Ok(false),
            Ok(None) => {}
            Err(e) => warn!(
                "记录无法解析，重置为 version 0: partition={}, name={}, error={}",
                self.partition, name, e
            ),
        }
        self.upsert(&FilterRecord::seeded(name)).await?;
        Ok(true)
    }

    /// 删除给定名称的记录与版本索引，返回实际存在并被删除的数量
    pub async fn remove<I, S>(&self, names: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(kv) = &self.kv else { return Ok(0) };

        let mut ops = Vec::new();
        let mut removed = 0usize;
        for name in names {
            let name = name.as_ref();
            if kv.exists(&self.partition, version_key(name)).await?
                || kv.exists(&self.partition, record_key(name)).await?
            {
                removed += 1;
            }
            ops.push(KvOp::delete(record_key(name)));
            ops.push(KvOp::delete(version_key(name)));
        }
        kv.apply_batch(&self.partition, ops).await?;

        Ok(removed)
    }

    /// 枚举所有记录（每次调用都重新读取存储）
    pub async fn enumerate_all(&self) -> Result<Vec<FilterRecord>> {
        let Some(kv) = &self.kv else { return Ok(Vec::new()) };

        let raw = kv
            .scan_prefix_raw(&self.partition, keys::FILTER_RECORD.as_bytes())
            .await?;
        let mut records = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            match serde_json::from_slice::<FilterRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "跳过无法解析的记录: key={}, error={}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(records)
    }

    /// 枚举本地版本
    ///
    /// 以可解析的完整记录为准：只有版本索引、没有值的条目不会出现在结果中。
    pub async fn enumerate_versions(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self
            .enumerate_all()
            .await?
            .into_iter()
            .map(|record| (record.name, record.version))
            .collect())
    }

    /// 本地存有数据、但没有可解析记录的过滤器名称
    pub async fn unreadable_names(&self) -> Result<BTreeSet<String>> {
        let readable: BTreeSet<String> = self.enumerate_versions().await?.into_keys().collect();
        let stored = self.stored_names().await?;
        Ok(stored.difference(&readable).cloned().collect())
    }

    /// 本地存有数据的全部过滤器名称（包括无法解析的旧数据）
    pub async fn stored_names(&self) -> Result<BTreeSet<String>> {
        let Some(kv) = &self.kv else { return Ok(BTreeSet::new()) };

        let mut names = BTreeSet::new();
        for prefix in [keys::FILTER_RECORD, keys::FILTER_VERSION] {
            for (key, _) in kv.scan_prefix_raw(&self.partition, prefix.as_bytes()).await? {
                names.insert(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
            }
        }
        Ok(names)
    }

    pub async fn flush(&self) -> Result<()> {
        let Some(kv) = &self.kv else { return Ok(()) };
        kv.flush().await
    }

    pub async fn stats(&self) -> Result<KvStats> {
        let Some(kv) = &self.kv else { return Ok(KvStats::default()) };
        kv.get_stats(&self.partition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_store(partition: &str) -> VersionStore {
        let kv = Arc::new(KvStore::temporary().unwrap());
        VersionStore::initialize(kv, partition).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = temp_store("eu1").await;
        let record = FilterRecord::new("dogs", 1, json!(["Poodle", "Dalmation"]));
        store.upsert(&record).await.unwrap();

        assert_eq!(store.get("dogs").await.unwrap(), Some(record));
        assert_eq!(store.get_version("dogs").await.unwrap(), Some(1));
        assert_eq!(store.get("hats").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_version_and_value_keep_index_consistent() {
        let store = temp_store("eu1").await;
        store.set_value("hats", json!(["Bowler"])).await.unwrap();
        assert_eq!(store.get_version("hats").await.unwrap(), Some(0));

        store.set_version("hats", 4).await.unwrap();
        let record = store.get("hats").await.unwrap().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.value, json!(["Bowler"]));
        assert_eq!(store.get_version("hats").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_seed_only_once() {
        let store = temp_store("eu1").await;
        assert!(store.seed("dogs").await.unwrap());
        assert!(!store.seed("dogs").await.unwrap());

        let record = store.get("dogs").await.unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert!(!record.is_fetched());
    }

    #[tokio::test]
    async fn test_remove_and_enumerate() {
        let store = temp_store("eu1").await;
        for (name, version) in [("a", 1), ("b", 2), ("c", 3)] {
            store
                .upsert(&FilterRecord::new(name, version, json!(name)))
                .await
                .unwrap();
        }

        let removed = store.remove(["a", "c", "missing"]).await.unwrap();
        assert_eq!(removed, 2);

        let records = store.enumerate_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "b");

        let versions = store.enumerate_versions().await.unwrap();
        assert_eq!(versions, BTreeMap::from([("b".to_string(), 2)]));
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let first = VersionStore::initialize(kv.clone(), "eu1").await.unwrap();
        first
            .upsert(&FilterRecord::new("dogs", 2, json!(["Poodle"])))
            .await
            .unwrap();

        let second = VersionStore::initialize(kv, "eu1").await.unwrap();
        assert_eq!(second.status(), StoreStatus::Available);
        assert_eq!(second.get_version("dogs").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_epoch_mismatch_detected() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        kv.open_partition("eu1").await.unwrap();
        kv.set("eu1", keys::SCHEMA_VERSION, &1u32).await.unwrap();
        kv.set("eu1", "filters_version:dogs", &3u64).await.unwrap();

        let store = VersionStore::initialize(kv, "eu1").await.unwrap();
        assert!(store.needs_cleanup());
        assert_eq!(
            store.status(),
            StoreStatus::EpochMismatch {
                stored: Some(1),
                expected: STORE_SCHEMA_VERSION
            }
        );

        store.complete_epoch_migration().await.unwrap();
        assert!(!store.needs_cleanup());
        assert_eq!(store.status(), StoreStatus::Available);
    }

    #[tokio::test]
    async fn test_legacy_entries_without_epoch_need_cleanup() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        kv.open_partition("eu1").await.unwrap();
        kv.set("eu1", "filters_record:dogs", &"legacy-string").await.unwrap();

        let store = VersionStore::initialize(kv, "eu1").await.unwrap();
        assert!(store.needs_cleanup());
        // 无法解析的旧记录被跳过，但仍出现在 stored_names 中以便清理
        assert!(store.enumerate_all().await.unwrap().is_empty());
        assert!(store.stored_names().await.unwrap().contains("dogs"));
    }

    #[tokio::test]
    async fn test_index_without_record_is_not_a_local_version() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = VersionStore::initialize(kv.clone(), "eu1").await.unwrap();
        kv.set("eu1", "filters_version:dogs", &1u64).await.unwrap();
        kv.set("eu1", "filters_version:hats", &2u64).await.unwrap();
        kv.set("eu1", "filters_record:hats", &"legacy-string").await.unwrap();
        store
            .upsert(&FilterRecord::new("cats", 3, json!(["Siamese"])))
            .await
            .unwrap();

        assert_eq!(
            store.enumerate_versions().await.unwrap(),
            BTreeMap::from([("cats".to_string(), 3)])
        );
        assert_eq!(
            store.unreadable_names().await.unwrap(),
            BTreeSet::from(["dogs".to_string(), "hats".to_string()])
        );

        // 登记时重置为 version 0，索引随之修正
        assert!(store.seed("dogs").await.unwrap());
        assert!(store.seed("hats").await.unwrap());
        assert!(!store.seed("cats").await.unwrap());
        assert_eq!(store.get_version("hats").await.unwrap(), Some(0));
        assert!(!store.get("hats").await.unwrap().unwrap().is_fetched());
        assert!(store.unreadable_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_inert() {
        let store = VersionStore::unavailable("eu1", "not supported");
        assert!(!store.is_available());
        assert!(matches!(store.status(), StoreStatus::Unavailable { .. }));

        store
            .upsert(&FilterRecord::new("dogs", 1, json!(["Poodle"])))
            .await
            .unwrap();
        assert!(!store.seed("dogs").await.unwrap());
        assert!(store.get("dogs").await.unwrap().is_none());
        assert!(store.enumerate_all().await.unwrap().is_empty());
        assert_eq!(store.remove(["dogs"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = VersionStore::open(temp_dir.path(), "eu1").await.unwrap();
            assert!(store.is_available());
            store
                .upsert(&FilterRecord::new("dogs", 7, json!(["Poodle"])))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let reopened = VersionStore::open(temp_dir.path(), "eu1").await.unwrap();
        assert_eq!(reopened.get_version("dogs").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_empty_partition_rejected() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let result = VersionStore::initialize(kv, "  ").await;
        assert!(matches!(result, Err(FilterCacheError::InvalidArgument(_))));
    }
}
