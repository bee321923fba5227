//! 推送通道 - 基于 SSE 的服务器版本变更通知
//!
//! 连接 `GET {push_url}/{session_id}`，收到 `updateVersion` 事件时对当前激活的
//! 过滤器执行一次版本检查。通道由 [`PushChannelHandle`] 持有，句柄关闭或被丢弃时
//! 后台任务随之结束。

use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FilterCacheError, Result};
use crate::events::{event_builders, EventManager};
use crate::registry::FilterRegistry;
use crate::sync::CacheSynchronizer;

/// 触发版本检查的服务器事件名
pub const UPDATE_VERSION_EVENT: &str = "updateVersion";

/// 推送通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 等待重连
    Reconnecting,
    /// 已关闭（句柄关闭或丢弃）
    Closed,
    /// 重连次数用尽
    Failed,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Disconnected => write!(f, "未连接"),
            ChannelStatus::Connecting => write!(f, "连接中"),
            ChannelStatus::Connected => write!(f, "已连接"),
            ChannelStatus::Reconnecting => write!(f, "重连中"),
            ChannelStatus::Closed => write!(f, "已关闭"),
            ChannelStatus::Failed => write!(f, "连接失败"),
        }
    }
}

/// 重连配置（指数退避 + 抖动）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 初始重连间隔（毫秒）
    pub initial_interval_ms: u64,
    /// 最大重连间隔（毫秒）
    pub max_interval_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 抖动比例，0.2 表示 ±20%
    pub jitter_ratio: f64,
    /// 连续失败后的最大重连次数，0 表示断开后不再重连
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 15_000, // 1s → 2s → 4s → 8s → 15s 封顶
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// 不重连
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重连前的基础等待时间（不含抖动，attempt 从 1 开始）
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let millis = self.initial_interval_ms as f64 * multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_interval_ms as f64) as u64)
    }

    /// 带抖动的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter_ratio.is_finite() {
            return base;
        }
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        base.mul_f64(factor)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// 状态单元：句柄与后台任务共享，每次状态变化发布事件
#[derive(Debug)]
struct StatusCell {
    status: RwLock<ChannelStatus>,
    events: Arc<EventManager>,
}

impl StatusCell {
    async fn transition(&self, new_state: ChannelStatus) {
        let old_state = {
            let mut status = self.status.write();
            let old = *status;
            *status = new_state;
            old
        };
        if old_state != new_state {
            info!("🔄 推送通道状态: {} -> {}", old_state, new_state);
            self.events
                .emit(event_builders::push_channel_state_changed(old_state, new_state))
                .await;
        }
    }

    fn get(&self) -> ChannelStatus {
        *self.status.read()
    }
}

/// 推送通道
#[derive(Debug)]
pub struct NotificationChannel {
    client: Client,
    url: String,
    synchronizer: Arc<CacheSynchronizer>,
    registry: Arc<FilterRegistry>,
    events: Arc<EventManager>,
    reconnect: ReconnectConfig,
}

impl NotificationChannel {
    pub fn new(
        client: Client,
        url: impl Into<String>,
        synchronizer: Arc<CacheSynchronizer>,
        registry: Arc<FilterRegistry>,
        events: Arc<EventManager>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            synchronizer,
            registry,
            events,
            reconnect,
        }
    }

    /// `{push_url}/{session_id}`
    pub fn endpoint(push_url: &str, session_id: &str) -> String {
        format!("{}/{}", push_url.trim_end_matches('/'), session_id)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 启动后台任务，返回持有通道生命周期的句柄
    pub fn open(self) -> PushChannelHandle {
        let cancel = CancellationToken::new();
        let status = Arc::new(StatusCell {
            status: RwLock::new(ChannelStatus::Disconnected),
            events: self.events.clone(),
        });

        info!("📡 打开推送通道: {}", self.url);
        let task = tokio::spawn(self.run(cancel.clone(), status.clone()));

        PushChannelHandle {
            cancel,
            status,
            task: Some(task),
        }
    }

    async fn run(self, cancel: CancellationToken, status: Arc<StatusCell>) {
        let mut attempt = 0u32;

        loop {
            let next = if attempt == 0 {
                ChannelStatus::Connecting
            } else {
                ChannelStatus::Reconnecting
            };
            status.transition(next).await;

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect_and_listen(&status, &mut attempt) => result,
            };

            match result {
                Ok(()) => info!("推送流已被服务器关闭: {}", self.url),
                Err(e) => warn!("⚠️ 推送通道断开: {}", e),
            }

            if cancel.is_cancelled() {
                break;
            }

            attempt += 1;
            if !self.reconnect.allows(attempt) {
                error!(
                    "❌ 推送通道不再重连 (max_attempts={}): {}",
                    self.reconnect.max_attempts, self.url
                );
                status.transition(ChannelStatus::Failed).await;
                return;
            }

            let delay = self.reconnect.delay_for(attempt);
            debug!("第 {} 次重连将在 {}ms 后进行", attempt, delay.as_millis());
            status.transition(ChannelStatus::Reconnecting).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        status.transition(ChannelStatus::Closed).await;
        info!("推送通道已关闭: {}", self.url);
    }

    async fn connect_and_listen(&self, status: &StatusCell, attempt: &mut u32) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| FilterCacheError::PushChannel(format!("连接失败: {}", e)))?;

        let http_status = response.status();
        if !http_status.is_success() {
            return Err(FilterCacheError::PushChannel(format!(
                "服务器拒绝推送连接，HTTP 状态码: {}",
                http_status
            )));
        }

        status.transition(ChannelStatus::Connected).await;
        *attempt = 0;

        let mut stream = response.bytes_stream().eventsource();
        while let Some(item) = stream.next().await {
            let event =
                item.map_err(|e| FilterCacheError::PushChannel(format!("读取推送流失败: {}", e)))?;

            if event.event != UPDATE_VERSION_EVENT {
                debug!("忽略推送事件: {}", event.event);
                continue;
            }

            debug!("📨 收到 updateVersion 推送");
            self.events
                .emit(event_builders::update_version_received())
                .await;

            let active = self.registry.active_names();
            if let Err(e) = self.synchronizer.check_version(&active).await {
                // 失败已由同步器记录并发布，等待下一次推送
                warn!("推送触发的版本检查失败: {}", e);
            }
        }

        Ok(())
    }
}

/// 推送通道句柄，丢弃时关闭通道
#[derive(Debug)]
pub struct PushChannelHandle {
    cancel: CancellationToken,
    status: Arc<StatusCell>,
    task: Option<JoinHandle<()>>,
}

impl PushChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 关闭通道并等待后台任务退出
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("推送通道任务异常退出: {}", e);
            }
        }
    }
}

impl Drop for PushChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
