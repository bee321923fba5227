use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::adapter::{FilterWidgetAdapter, SelectOption};
use crate::error::{FilterCacheError, Result};
use crate::events::{event_builders, EventFilter, EventManager, FilterEvent, FilteredEventReceiver};
use crate::network::{build_client, FilterTransport, HttpFilterTransport};
use crate::push_channel::{ChannelStatus, NotificationChannel, PushChannelHandle, ReconnectConfig};
use crate::registry::{FilterOptions, FilterRegistry};
use crate::storage::{StoreStatus, VersionStore};
use crate::sync::{CacheSynchronizer, CheckOutcome, SyncState};
use crate::version::SDK_VERSION;

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 单次版本检查请求超时（秒），推送长连接不受此限制
    pub request_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
            user_agent: Some(format!("filter-cache-sdk/{}", SDK_VERSION)),
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// 过滤器缓存 SDK 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCacheConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 是否启用本地存储；关闭时每次检查都完整拉取
    pub storage_enabled: bool,
    /// 分区键（例如区域 `eu1`），不同分区的缓存互不可见
    pub partition: String,
    /// 版本检查接口
    pub check_url: String,
    /// 推送通道基础地址，实际连接 `{push_url}/{session_id}`
    pub push_url: Option<String>,
    /// 会话 ID，不设置时自动生成
    pub session_id: Option<String>,
    /// 单个检查周期的总超时（秒）
    pub check_timeout_secs: u64,
    pub http_client_config: HttpClientConfig,
    pub reconnect_config: ReconnectConfig,
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for FilterCacheConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            storage_enabled: true,
            partition: "default".to_string(),
            check_url: "http://localhost:8080/filters/check-version".to_string(),
            push_url: None,
            session_id: None,
            check_timeout_secs: 30,
            http_client_config: HttpClientConfig::default(),
            reconnect_config: ReconnectConfig::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.filter_cache/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".filter_cache")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".filter_cache")
    } else {
        PathBuf::from("./filter_cache_data")
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}

impl FilterCacheConfig {
    pub fn builder() -> FilterCacheConfigBuilder {
        FilterCacheConfigBuilder::new()
    }

    /// 从 TOML 文本加载（缺省字段取默认值）
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.partition.trim().is_empty() {
            return Err(FilterCacheError::Config("partition 不能为空".to_string()));
        }
        if !is_http_url(&self.check_url) {
            return Err(FilterCacheError::Config(format!(
                "check_url 必须是 http(s) 地址: {}",
                self.check_url
            )));
        }
        if let Some(push_url) = &self.push_url {
            if !is_http_url(push_url) {
                return Err(FilterCacheError::Config(format!(
                    "push_url 必须是 http(s) 地址: {}",
                    push_url
                )));
            }
        }
        if let Some(session_id) = &self.session_id {
            if session_id.trim().is_empty() || session_id.contains('/') {
                return Err(FilterCacheError::Config(format!(
                    "session_id 无效: {:?}",
                    session_id
                )));
            }
        }
        if self.check_timeout_secs == 0 {
            return Err(FilterCacheError::Config("check_timeout_secs 必须大于 0".to_string()));
        }
        if self.http_client_config.connect_timeout_secs == Some(0)
            || self.http_client_config.request_timeout_secs == Some(0)
        {
            return Err(FilterCacheError::Config("HTTP 超时必须大于 0".to_string()));
        }
        if self.event_config.buffer_size == 0 {
            return Err(FilterCacheError::Config("事件缓冲区大小必须大于 0".to_string()));
        }
        let reconnect = &self.reconnect_config;
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(FilterCacheError::Config(format!(
                "重连退避倍数必须是不小于 1 的有限数: {}",
                reconnect.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(FilterCacheError::Config(format!(
                "重连抖动比例必须在 0 到 1 之间: {}",
                reconnect.jitter_ratio
            )));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FilterCacheConfigBuilder {
    config: FilterCacheConfig,
}

impl FilterCacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FilterCacheConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn storage_enabled(mut self, enabled: bool) -> Self {
        self.config.storage_enabled = enabled;
        self
    }

    pub fn partition<S: Into<String>>(mut self, partition: S) -> Self {
        self.config.partition = partition.into();
        self
    }

    pub fn check_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.check_url = url.into();
        self
    }

    pub fn push_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.push_url = Some(url.into());
        self
    }

    pub fn session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.config.session_id = Some(session_id.into());
        self
    }

    pub fn check_timeout(mut self, secs: u64) -> Self {
        self.config.check_timeout_secs = secs;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect_config = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> FilterCacheConfig {
        self.config
    }
}

/// 过滤器缓存 SDK 主接口
///
/// 分层结构：
/// - 存储层：VersionStore
/// - 同步层：CacheSynchronizer（经由 FilterTransport 访问服务器）
/// - 推送层：NotificationChannel
/// - 展示层：FilterWidgetAdapter
/// - 事件层：EventManager
#[derive(Debug)]
pub struct FilterCacheSDK {
    config: FilterCacheConfig,
    session_id: String,
    store: Arc<VersionStore>,
    registry: Arc<FilterRegistry>,
    events: Arc<EventManager>,
    synchronizer: Arc<CacheSynchronizer>,
    adapter: FilterWidgetAdapter,
    /// 推送通道句柄（同一时刻最多一个）
    push_channel: Mutex<Option<PushChannelHandle>>,
    shutting_down: RwLock<bool>,
}

impl FilterCacheSDK {
    /// 按配置初始化：打开本地存储并创建 HTTP 传输
    pub async fn initialize(config: FilterCacheConfig) -> Result<Arc<Self>> {
        info!("正在初始化 FilterCacheSDK v{}...", SDK_VERSION);
        config.validate()?;

        let store = if config.storage_enabled {
            VersionStore::open(&config.data_dir, &config.partition).await?
        } else {
            VersionStore::unavailable(&config.partition, "本地存储已禁用")
        };

        let transport = HttpFilterTransport::new(&config.http_client_config, config.check_url.clone())?;
        Self::with_transport(config, Arc::new(store), Arc::new(transport)).await
    }

    /// 使用外部提供的存储与传输组装 SDK
    pub async fn with_transport(
        config: FilterCacheConfig,
        store: Arc<VersionStore>,
        transport: Arc<dyn FilterTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = Arc::new(EventManager::new(config.event_config.buffer_size));
        let registry = Arc::new(FilterRegistry::new());

        // 存储打开失败时 VersionStore 已记录警告，这里只发布一次事件
        if let StoreStatus::Unavailable { reason } = store.status() {
            events
                .emit(event_builders::storage_unavailable(store.partition(), &reason))
                .await;
        }

        let synchronizer = Arc::new(CacheSynchronizer::new(
            store.clone(),
            transport,
            events.clone(),
            config.check_timeout(),
        ));
        let adapter = FilterWidgetAdapter::new(store.clone(), registry.clone(), events.clone());

        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        info!(
            "✅ FilterCacheSDK 初始化完成: partition={}, session={}",
            store.partition(),
            session_id
        );

        Ok(Arc::new(Self {
            config,
            session_id,
            store,
            registry,
            events,
            synchronizer,
            adapter,
            push_channel: Mutex::new(None),
            shutting_down: RwLock::new(false),
        }))
    }

    pub fn config(&self) -> &FilterCacheConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    pub fn synchronizer(&self) -> &Arc<CacheSynchronizer> {
        &self.synchronizer
    }

    pub fn adapter(&self) -> &FilterWidgetAdapter {
        &self.adapter
    }

    pub fn sync_state(&self) -> SyncState {
        self.synchronizer.state()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(FilterCacheError::ShuttingDown("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    // ========== 过滤器 ==========

    /// 注册过滤器控件；下一次检查时参与版本比较
    pub fn add_filter(&self, name: &str, options: FilterOptions) -> Result<bool> {
        self.ensure_running()?;
        self.adapter.add_filter(name, options)
    }

    /// 注销过滤器并清理其本地缓存，返回该过滤器是否曾注册
    pub async fn remove_filter(&self, name: &str) -> Result<bool> {
        self.ensure_running()?;
        if self.registry.unregister(name).is_none() {
            return Ok(false);
        }
        self.synchronizer.evict(&[name.to_string()]).await?;
        Ok(true)
    }

    pub async fn get_value(&self, name: &str) -> Option<Value> {
        self.adapter.get_value(name).await
    }

    pub async fn get_options(&self, name: &str) -> Vec<SelectOption> {
        self.adapter.get_options(name).await
    }

    pub async fn on_data_changed<F>(&self, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.adapter.on_data_changed(callback).await;
    }

    /// 立即对所有激活的过滤器执行一次版本检查
    pub async fn check_now(&self) -> Result<CheckOutcome> {
        self.ensure_running()?;
        self.synchronizer
            .check_version(&self.registry.active_names())
            .await
    }

    // ========== 推送通道 ==========

    /// 打开推送通道；已有可用通道时直接返回
    pub async fn open_push_channel(&self) -> Result<()> {
        self.ensure_running()?;

        let push_url = self
            .config
            .push_url
            .as_deref()
            .ok_or_else(|| FilterCacheError::Config("未配置 push_url".to_string()))?;

        let mut slot = self.push_channel.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !matches!(handle.status(), ChannelStatus::Closed | ChannelStatus::Failed) {
                return Ok(());
            }
        }

        let client = build_client(&self.config.http_client_config)?;
        let channel = NotificationChannel::new(
            client,
            NotificationChannel::endpoint(push_url, &self.session_id),
            self.synchronizer.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.reconnect_config.clone(),
        );

        // 旧句柄在替换时被丢弃，后台任务随之取消
        *slot = Some(channel.open());
        Ok(())
    }

    pub async fn close_push_channel(&self) {
        let handle = self.push_channel.lock().await.take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    pub async fn push_channel_status(&self) -> Option<ChannelStatus> {
        self.push_channel.lock().await.as_ref().map(|h| h.status())
    }

    // ========== 事件 ==========

    pub fn subscribe_events(&self) -> broadcast::Receiver<FilterEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    // ========== 生命周期 ==========

    /// 关闭推送通道并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 FilterCacheSDK...");
        {
            let mut shutting_down = self.shutting_down.write();
            if *shutting_down {
                return Ok(());
            }
            *shutting_down = true;
        }

        self.close_push_channel().await;
        self.store.flush().await?;

        info!("FilterCacheSDK 关闭完成");
        Ok(())
    }
}
