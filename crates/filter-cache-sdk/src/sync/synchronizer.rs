//! 缓存同步器
//!
//! 职责：
//! - 读取本地版本索引，登记首次出现的过滤器（version 0）
//! - 每个周期发送一次版本检查请求
//! - 对服务器确认的新版本原子写入并发布 DataChanged
//! - 网络失败时不改动本地缓存，也不自动重试（由下一次触发重新开始）

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{FilterCacheError, Result};
use crate::events::{event_builders, now_millis, EventManager};
use crate::network::{CheckVersionRequest, FilterTransport};
use crate::storage::{FilterRecord, VersionStore};
use crate::sync::{CheckOutcome, SyncState, SyncStats};

/// 缓存同步器
#[derive(Debug)]
pub struct CacheSynchronizer {
    store: Arc<VersionStore>,
    transport: Arc<dyn FilterTransport>,
    events: Arc<EventManager>,
    check_timeout: Duration,
    /// 检查锁：重入的 check_version 排队等待，保证同一时刻最多一个在途请求
    check_lock: Mutex<()>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl CacheSynchronizer {
    pub fn new(
        store: Arc<VersionStore>,
        transport: Arc<dyn FilterTransport>,
        events: Arc<EventManager>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            check_timeout,
            check_lock: Mutex::new(()),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// 是否有检查正在进行
    pub fn is_checking(&self) -> bool {
        self.check_lock.try_lock().is_err()
    }

    /// 对激活的过滤器执行一次版本检查
    pub async fn check_version(&self, active: &BTreeSet<String>) -> Result<CheckOutcome> {
        let _guard = self.check_lock.lock().await;
        let partition = self.store.partition().to_string();

        *self.state.write() = SyncState::Syncing;
        {
            let mut stats = self.stats.write();
            stats.checks_started += 1;
            stats.last_check_at = Some(now_millis());
        }

        info!("开始版本检查: partition={}, filters={}", partition, active.len());

        match self.run_check(active).await {
            Ok(outcome) => {
                info!(
                    "版本检查完成: partition={}, updated={:?}",
                    partition, outcome.updated
                );
                *self.state.write() = SyncState::Synced {
                    updated: outcome.updated.len(),
                    last_sync_at: now_millis(),
                };
                {
                    let mut stats = self.stats.write();
                    stats.checks_completed += 1;
                    stats.records_updated += outcome.updated.len() as u64;
                    stats.records_evicted += outcome.evicted.len() as u64;
                }
                self.events
                    .emit(event_builders::check_completed(&partition, outcome.updated.clone()))
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                error!("版本检查失败: partition={}, error={}", partition, e);
                *self.state.write() = SyncState::Failed {
                    error: e.to_string(),
                    recoverable: e.is_recoverable(),
                    failed_at: now_millis(),
                };
                self.stats.write().checks_failed += 1;
                self.events
                    .emit(event_builders::check_failed(&partition, &e))
                    .await;
                Err(e)
            }
        }
    }

    /// 删除本地存在、但不在服务器过滤器列表中的条目
    pub async fn delete_stale_entries(&self, server_names: &BTreeSet<String>) -> Result<Vec<String>> {
        let _guard = self.check_lock.lock().await;
        let evicted = self.remove_stale(server_names).await?;
        self.stats.write().records_evicted += evicted.len() as u64;
        Ok(evicted)
    }

    /// 激活集合缩小时显式清理
    pub async fn evict(&self, names: &[String]) -> Result<usize> {
        if names.is_empty() {
            return Ok(0);
        }
        let _guard = self.check_lock.lock().await;
        let removed = self.store.remove(names).await?;
        if removed > 0 {
            self.stats.write().records_evicted += removed as u64;
            self.events
                .emit(event_builders::entries_evicted(self.store.partition(), names.to_vec()))
                .await;
        }
        Ok(removed)
    }

    // ============================================================
    // 私有方法
    // ============================================================

    async fn remove_stale(&self, server_names: &BTreeSet<String>) -> Result<Vec<String>> {
        let stored = self.store.stored_names().await?;
        let stale: Vec<String> = stored.difference(server_names).cloned().collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        self.store.remove(&stale).await?;
        info!(
            "已清理过期条目: partition={}, names={:?}",
            self.store.partition(),
            stale
        );
        self.events
            .emit(event_builders::entries_evicted(self.store.partition(), stale.clone()))
            .await;
        Ok(stale)
    }

    /// 没有可解析记录的条目（旧格式的版本索引等）整体删除，随后以 version 0 重新登记
    async fn remove_unreadable(&self) -> Result<Vec<String>> {
        let unreadable: Vec<String> = self.store.unreadable_names().await?.into_iter().collect();
        if unreadable.is_empty() {
            return Ok(unreadable);
        }

        self.store.remove(&unreadable).await?;
        warn!(
            "已清理无法解析的旧条目: partition={}, names={:?}",
            self.store.partition(),
            unreadable
        );
        self.events
            .emit(event_builders::entries_evicted(self.store.partition(), unreadable.clone()))
            .await;
        Ok(unreadable)
    }

    async fn run_check(&self, active: &BTreeSet<String>) -> Result<CheckOutcome> {
        let partition = self.store.partition().to_string();
        let mut outcome = CheckOutcome::default();

        // 1. schema 版本不一致：先清理再比较
        if self.store.needs_cleanup() {
            outcome.evicted = self.remove_stale(active).await?;
            outcome.evicted.extend(self.remove_unreadable().await?);
            self.store.complete_epoch_migration().await?;
        }

        if active.is_empty() {
            debug!("没有激活的过滤器，跳过版本检查: partition={}", partition);
            return Ok(outcome);
        }

        // 2. 读取本地版本（以完整记录为准），登记缺失的过滤器
        let local = self.store.enumerate_versions().await?;
        for name in active {
            if !local.contains_key(name) && self.store.seed(name).await? {
                outcome.seeded.push(name.clone());
            }
        }

        // 3. 构造请求（只包含激活的过滤器）
        let versions: BTreeMap<String, u64> = active
            .iter()
            .map(|name| (name.clone(), local.get(name).copied().unwrap_or(0)))
            .collect();
        let request = CheckVersionRequest::new(partition.clone(), versions);
        outcome.requested = request.versions.keys().cloned().collect();

        self.events
            .emit(event_builders::check_started(&partition, outcome.requested.clone()))
            .await;

        // 4. 唯一的网络调用
        let response = match tokio::time::timeout(
            self.check_timeout,
            self.transport.check_versions(&request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(FilterCacheError::Timeout(format!(
                    "版本检查超过 {}ms 未返回",
                    self.check_timeout.as_millis()
                )))
            }
        };

        if response.is_empty() {
            debug!("服务器报告没有变化: partition={}", partition);
            return Ok(outcome);
        }

        // 5. 写入服务器确认的新版本
        for update in response.updates {
            let Some(&local_version) = request.versions.get(&update.name) else {
                debug!("忽略非激活过滤器的更新: {}", update.name);
                outcome.ignored.push(update.name);
                continue;
            };

            if update.version <= local_version {
                if update.version < local_version {
                    warn!(
                        "服务器版本低于本地版本，忽略: name={}, local={}, server={}",
                        update.name, local_version, update.version
                    );
                    outcome.ignored.push(update.name);
                }
                continue;
            }

            let Some(value) = update.value else {
                warn!(
                    "服务器下发了新版本但缺少值，忽略: name={}, version={}",
                    update.name, update.version
                );
                outcome.ignored.push(update.name);
                continue;
            };

            let record = FilterRecord::new(update.name.clone(), update.version, value);
            self.store.upsert(&record).await?;
            debug!(
                "过滤器已更新: name={}, {} -> {}",
                record.name, local_version, record.version
            );

            self.events
                .emit(event_builders::data_changed(
                    &partition,
                    &record.name,
                    record.version,
                    record.value,
                ))
                .await;
            outcome.updated.push(update.name);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FilterEvent;
    use crate::network::MockTransport;
    use crate::storage::{KvStore, StoreStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn temp_store(partition: &str) -> Arc<VersionStore> {
        let kv = Arc::new(KvStore::temporary().unwrap());
        Arc::new(VersionStore::initialize(kv, partition).await.unwrap())
    }

    fn synchronizer(store: Arc<VersionStore>, transport: Arc<MockTransport>) -> CacheSynchronizer {
        CacheSynchronizer::new(
            store,
            transport,
            Arc::new(EventManager::new(64)),
            Duration::from_secs(5),
        )
    }

    async fn count_data_changed(sync: &CacheSynchronizer) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        sync.events
            .add_listener("data_changed", move |_event| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        counter
    }

    #[tokio::test]
    async fn test_first_check_seeds_and_populates() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({
            "dogs__version": 1,
            "dogs": ["Poodle", "Dalmation"],
            "hats__version": 1,
            "hats": ["Bowler", "Top", "Sun"],
        }));
        let sync = synchronizer(store.clone(), transport.clone());
        let changed = count_data_changed(&sync).await;

        let outcome = sync.check_version(&names(&["dogs", "hats"])).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].partition, "eu1");
        assert_eq!(requests[0].filters, "dogs,hats");
        assert_eq!(
            requests[0].versions,
            BTreeMap::from([("dogs".to_string(), 0), ("hats".to_string(), 0)])
        );

        assert_eq!(outcome.seeded, vec!["dogs".to_string(), "hats".to_string()]);
        assert_eq!(outcome.updated, vec!["dogs".to_string(), "hats".to_string()]);

        let dogs = store.get("dogs").await.unwrap().unwrap();
        assert_eq!(dogs.version, 1);
        assert_eq!(dogs.value, json!(["Poodle", "Dalmation"]));
        let hats = store.get("hats").await.unwrap().unwrap();
        assert_eq!(hats.version, 1);
        assert_eq!(hats.value, json!(["Bowler", "Top", "Sun"]));

        assert_eq!(changed.load(Ordering::SeqCst), 2);
        assert!(matches!(sync.state(), SyncState::Synced { updated: 2, .. }));
    }

    #[tokio::test]
    async fn test_second_check_without_changes_writes_nothing() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));
        // 第二次：服务器重复报告相同版本
        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));
        let sync = synchronizer(store.clone(), transport.clone());
        let active = names(&["dogs"]);

        sync.check_version(&active).await.unwrap();
        let before = store.enumerate_all().await.unwrap();
        let changed = count_data_changed(&sync).await;

        let outcome = sync.check_version(&active).await.unwrap();
        assert!(outcome.is_unchanged());
        assert!(outcome.seeded.is_empty());
        assert_eq!(store.enumerate_all().await.unwrap(), before);
        assert_eq!(changed.load(Ordering::SeqCst), 0);
        assert_eq!(transport.requests()[1].versions.get("dogs"), Some(&1));

        // 第三次：空响应
        let outcome = sync.check_version(&active).await.unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(store.enumerate_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_only_stale_filters_are_mutated() {
        let store = temp_store("eu1").await;
        store.upsert(&FilterRecord::new("a", 1, json!("old-a"))).await.unwrap();
        store.upsert(&FilterRecord::new("b", 2, json!("old-b"))).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"a__version": 1, "b__version": 3, "b": "newval"}));
        let sync = synchronizer(store.clone(), transport);

        let outcome = sync.check_version(&names(&["a", "b"])).await.unwrap();
        assert_eq!(outcome.updated, vec!["b".to_string()]);
        assert_eq!(
            store.get("a").await.unwrap(),
            Some(FilterRecord::new("a", 1, json!("old-a")))
        );
        assert_eq!(
            store.get("b").await.unwrap(),
            Some(FilterRecord::new("b", 3, json!("newval")))
        );
    }

    #[tokio::test]
    async fn test_versions_never_decrease() {
        let store = temp_store("eu1").await;
        store.upsert(&FilterRecord::new("a", 5, json!("v5"))).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"a__version": 3, "a": "v3"}));
        let sync = synchronizer(store.clone(), transport);

        let outcome = sync.check_version(&names(&["a"])).await.unwrap();
        assert!(outcome.updated.is_empty());
        assert_eq!(outcome.ignored, vec!["a".to_string()]);
        assert_eq!(store.get_version("a").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_version_without_value_and_inactive_names_ignored() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({
            "a__version": 2,
            "zebra__version": 4,
            "zebra": ["stripes"],
        }));
        let sync = synchronizer(store.clone(), transport);

        let outcome = sync.check_version(&names(&["a"])).await.unwrap();
        assert!(outcome.updated.is_empty());
        assert_eq!(outcome.ignored, vec!["a".to_string(), "zebra".to_string()]);
        assert_eq!(store.get_version("a").await.unwrap(), Some(0));
        assert!(store.get("zebra").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_failure_leaves_cache_untouched() {
        let store = temp_store("eu1").await;
        store.upsert(&FilterRecord::new("a", 1, json!("v1"))).await.unwrap();
        let before = store.enumerate_all().await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push_error(FilterCacheError::Transport("connection refused".to_string()));
        let sync = synchronizer(store.clone(), transport.clone());
        let mut events = sync.events.subscribe();

        let result = sync.check_version(&names(&["a"])).await;
        let err = result.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(store.enumerate_all().await.unwrap(), before);
        assert!(matches!(sync.state(), SyncState::Failed { recoverable: true, .. }));
        assert_eq!(sync.stats().checks_failed, 1);
        // 不自动重试
        assert_eq!(transport.requests().len(), 1);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let FilterEvent::CheckFailed { recoverable, .. } = event {
                assert!(recoverable);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::with_delay(Duration::from_millis(500)));
        transport.push_response(json!({"a__version": 1, "a": "late"}));
        let sync = CacheSynchronizer::new(
            store.clone(),
            transport,
            Arc::new(EventManager::new(16)),
            Duration::from_millis(50),
        );

        let err = sync.check_version(&names(&["a"])).await.unwrap_err();
        assert!(matches!(err, FilterCacheError::Timeout(_)));
        assert!(err.is_recoverable());
        assert_eq!(store.get_version("a").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_checks_are_serialized() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::with_delay(Duration::from_millis(50)));
        transport.push_response(json!({"a__version": 1, "a": "v1"}));
        transport.push_response(json!({"a__version": 2, "a": "v2"}));
        let sync = Arc::new(synchronizer(store.clone(), transport.clone()));
        let active = names(&["a"]);

        let (first, second) = tokio::join!(sync.check_version(&active), sync.check_version(&active));
        first.unwrap();
        second.unwrap();

        assert_eq!(transport.max_in_flight(), 1);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        // 第二个请求在第一个写入完成之后才发出
        assert_eq!(requests[1].versions.get("a"), Some(&1));
        assert_eq!(store.get_version("a").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_unavailable_storage_still_completes() {
        let store = Arc::new(VersionStore::unavailable("eu1", "not supported"));
        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));
        let sync = synchronizer(store.clone(), transport.clone());
        let changed = count_data_changed(&sync).await;

        let outcome = sync.check_version(&names(&["dogs"])).await.unwrap();
        assert_eq!(outcome.updated, vec!["dogs".to_string()]);
        assert!(outcome.seeded.is_empty());
        assert_eq!(transport.requests()[0].versions.get("dogs"), Some(&0));
        assert!(store.get("dogs").await.unwrap().is_none());
        assert_eq!(changed.load(Ordering::SeqCst), 1);

        // 每次都完整拉取
        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));
        sync.check_version(&names(&["dogs"])).await.unwrap();
        assert_eq!(transport.requests()[1].versions.get("dogs"), Some(&0));
    }

    #[tokio::test]
    async fn test_delete_stale_entries_removes_unlisted_names() {
        let store = temp_store("eu1").await;
        for name in ["a", "b", "c"] {
            store.upsert(&FilterRecord::new(name, 1, json!(name))).await.unwrap();
        }
        let sync = synchronizer(store.clone(), Arc::new(MockTransport::new()));

        let evicted = sync.delete_stale_entries(&names(&["b"])).await.unwrap();
        assert_eq!(evicted, vec!["a".to_string(), "c".to_string()]);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_epoch_mismatch_triggers_cleanup_before_check() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        kv.open_partition("eu1").await.unwrap();
        kv.set("eu1", crate::storage::keys::SCHEMA_VERSION, &1u32).await.unwrap();
        kv.set("eu1", "filters_version:retired", &9u64).await.unwrap();
        kv.set("eu1", "filters_version:dogs", &1u64).await.unwrap();
        let store = Arc::new(VersionStore::initialize(kv, "eu1").await.unwrap());
        assert!(store.needs_cleanup());

        let transport = Arc::new(MockTransport::new());
        let sync = synchronizer(store.clone(), transport.clone());

        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));

        let outcome = sync.check_version(&names(&["dogs"])).await.unwrap();
        assert_eq!(outcome.evicted, vec!["retired".to_string(), "dogs".to_string()]);
        assert_eq!(outcome.seeded, vec!["dogs".to_string()]);
        assert_eq!(store.status(), StoreStatus::Available);
        assert!(store.get_version("retired").await.unwrap().is_none());
        // 旧索引里的版本没有对应的值，按 version 0 重新拉取
        assert_eq!(transport.requests()[0].versions.get("dogs"), Some(&0));
        assert_eq!(outcome.updated, vec!["dogs".to_string()]);
        assert_eq!(
            store.get("dogs").await.unwrap(),
            Some(FilterRecord::new("dogs", 1, json!(["Poodle"])))
        );
    }

    #[tokio::test]
    async fn test_legacy_record_is_refetched_after_epoch_change() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        kv.open_partition("eu1").await.unwrap();
        kv.set("eu1", crate::storage::keys::SCHEMA_VERSION, &1u32).await.unwrap();
        kv.set("eu1", "filters_version:dogs", &1u64).await.unwrap();
        kv.set("eu1", "filters_record:dogs", &"legacy").await.unwrap();
        let store = Arc::new(VersionStore::initialize(kv, "eu1").await.unwrap());

        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"dogs__version": 1, "dogs": ["Poodle"]}));
        transport.push_response(json!({"dogs__version": 1}));
        let sync = synchronizer(store.clone(), transport.clone());
        let active = names(&["dogs"]);

        sync.check_version(&active).await.unwrap();
        sync.check_version(&active).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].versions.get("dogs"), Some(&0));
        assert_eq!(requests[1].versions.get("dogs"), Some(&1));
        let dogs = store.get("dogs").await.unwrap().unwrap();
        assert_eq!(dogs.version, 1);
        assert_eq!(dogs.value, json!(["Poodle"]));
    }

    #[tokio::test]
    async fn test_index_without_record_is_requested_as_unfetched() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = Arc::new(VersionStore::initialize(kv.clone(), "eu1").await.unwrap());
        kv.set("eu1", "filters_version:hats", &4u64).await.unwrap();
        assert!(!store.needs_cleanup());

        let transport = Arc::new(MockTransport::new());
        transport.push_response(json!({"hats__version": 4, "hats": ["Bowler"]}));
        let sync = synchronizer(store.clone(), transport.clone());

        let outcome = sync.check_version(&names(&["hats"])).await.unwrap();
        assert_eq!(transport.requests()[0].versions.get("hats"), Some(&0));
        assert_eq!(outcome.updated, vec!["hats".to_string()]);
        assert_eq!(store.get("hats").await.unwrap().unwrap().value, json!(["Bowler"]));
    }

    #[tokio::test]
    async fn test_evict_removes_named_entries() {
        let store = temp_store("eu1").await;
        store.upsert(&FilterRecord::new("a", 1, json!("v"))).await.unwrap();
        let sync = synchronizer(store.clone(), Arc::new(MockTransport::new()));

        assert_eq!(sync.evict(&["a".to_string()]).await.unwrap(), 1);
        assert_eq!(sync.evict(&["a".to_string()]).await.unwrap(), 0);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_active_set_skips_network() {
        let store = temp_store("eu1").await;
        let transport = Arc::new(MockTransport::new());
        let sync = synchronizer(store, transport.clone());

        let outcome = sync.check_version(&BTreeSet::new()).await.unwrap();
        assert!(outcome.requested.is_empty());
        assert!(transport.requests().is_empty());
    }
}
