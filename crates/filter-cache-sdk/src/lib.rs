//! Filter Cache SDK - 带服务器失效通知的本地过滤器缓存
//!
//! 本 SDK 为搜索/筛选页面缓存下拉过滤器的选项数据：
//! - 💾 本地持久化：按分区隔离的 sled 存储，版本与值原子写入
//! - 🔁 版本同步：每个周期一次请求，只拉取过期或缺失的过滤器
//! - 📡 推送失效：SSE 通道收到 `updateVersion` 后立即检查
//! - 🧩 控件适配：把缓存值转换为下拉选项，数据更新时回调
//! - ⚙️ 事件系统：统一的事件广播与监听
//! - 🧯 降级运行：本地存储不可用时退化为每次完整拉取
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use filter_cache_sdk::{FilterCacheConfig, FilterCacheSDK, FilterOptions};
//!
//! #[tokio::main]
//! async fn main() -> filter_cache_sdk::Result<()> {
//!     let config = FilterCacheConfig::builder()
//!         .data_dir("/path/to/data")
//!         .partition("eu1")
//!         .check_url("https://api.example.com/filters/check-version")
//!         .push_url("https://api.example.com/filters/push")
//!         .build();
//!
//!     let sdk = FilterCacheSDK::initialize(config).await?;
//!
//!     sdk.add_filter("dogs", FilterOptions::new().with_label("Dogs"))?;
//!     sdk.on_data_changed(|name, value| {
//!         println!("{} 已更新: {}", name, value);
//!     })
//!     .await;
//!
//!     sdk.check_now().await?;
//!     sdk.open_push_channel().await?;
//!
//!     for option in sdk.get_options("dogs").await {
//!         println!("{} => {}", option.value, option.label);
//!     }
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod adapter;
pub mod error;
pub mod events;
pub mod logging;
pub mod network;
pub mod push_channel;
pub mod registry;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use adapter::{FilterWidgetAdapter, SelectOption};
pub use error::{FilterCacheError, Result};
pub use events::{event_builders, EventFilter, EventManager, FilterEvent, FilteredEventReceiver};
pub use logging::init_logging;
pub use network::{CheckVersionRequest, FilterTransport, HttpFilterTransport, VersionCheckResponse};
pub use push_channel::{ChannelStatus, NotificationChannel, PushChannelHandle, ReconnectConfig};
pub use registry::{FilterOptions, FilterRegistry};
pub use sdk::{EventConfig, FilterCacheConfig, FilterCacheConfigBuilder, FilterCacheSDK, HttpClientConfig};
pub use storage::{FilterRecord, StoreStatus, VersionStore};
pub use sync::{CacheSynchronizer, CheckOutcome, SyncState, SyncStats};
pub use version::{SDK_VERSION, STORE_SCHEMA_VERSION};
