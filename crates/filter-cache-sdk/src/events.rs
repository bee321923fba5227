//! 事件系统模块 - 过滤器缓存中的各种事件
//!
//! 功能包括：
//! - 过滤器数据变更事件（控件据此重新渲染）
//! - 版本检查开始 / 完成 / 失败事件
//! - 条目清理、存储不可用、推送通道状态事件
//! - 事件广播和订阅机制

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::push_channel::ChannelStatus;

/// 当前 UTC 毫秒时间戳
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterEvent {
    /// 过滤器数据已更新
    DataChanged {
        partition: String,
        name: String,
        version: u64,
        value: serde_json::Value,
        timestamp: u64,
    },
    /// 版本检查开始
    CheckStarted {
        partition: String,
        filters: Vec<String>,
        timestamp: u64,
    },
    /// 版本检查完成（updated 为空表示没有变化）
    CheckCompleted {
        partition: String,
        updated: Vec<String>,
        timestamp: u64,
    },
    /// 版本检查失败，本地缓存未改动
    CheckFailed {
        partition: String,
        error: String,
        recoverable: bool,
        timestamp: u64,
    },
    /// 本地条目被清理
    EntriesEvicted {
        partition: String,
        names: Vec<String>,
        timestamp: u64,
    },
    /// 本地存储不可用（只在初始化时报告一次）
    StorageUnavailable {
        partition: String,
        reason: String,
        timestamp: u64,
    },
    /// 推送通道状态变更
    PushChannelStateChanged {
        old_state: ChannelStatus,
        new_state: ChannelStatus,
        timestamp: u64,
    },
    /// 收到服务器 updateVersion 推送
    UpdateVersionReceived { timestamp: u64 },
}

impl FilterEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            FilterEvent::DataChanged { .. } => "data_changed",
            FilterEvent::CheckStarted { .. } => "check_started",
            FilterEvent::CheckCompleted { .. } => "check_completed",
            FilterEvent::CheckFailed { .. } => "check_failed",
            FilterEvent::EntriesEvicted { .. } => "entries_evicted",
            FilterEvent::StorageUnavailable { .. } => "storage_unavailable",
            FilterEvent::PushChannelStateChanged { .. } => "push_channel_state_changed",
            FilterEvent::UpdateVersionReceived { .. } => "update_version_received",
        }
    }

    /// 获取相关过滤器名称（仅单过滤器事件）
    pub fn filter_name(&self) -> Option<&str> {
        match self {
            FilterEvent::DataChanged { name, .. } => Some(name),
            _ => None,
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            FilterEvent::DataChanged { timestamp, .. }
            | FilterEvent::CheckStarted { timestamp, .. }
            | FilterEvent::CheckCompleted { timestamp, .. }
            | FilterEvent::CheckFailed { timestamp, .. }
            | FilterEvent::EntriesEvicted { timestamp, .. }
            | FilterEvent::StorageUnavailable { timestamp, .. }
            | FilterEvent::PushChannelStateChanged { timestamp, .. }
            | FilterEvent::UpdateVersionReceived { timestamp } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤
    pub event_types: Option<Vec<String>>,
    /// 过滤器名称过滤（只作用于单过滤器事件）
    pub filter_names: Option<Vec<String>>,
}

impl EventFilter {
    /// 创建新的事件过滤器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 设置过滤器名称过滤
    pub fn with_filter_names(mut self, filter_names: Vec<String>) -> Self {
        self.filter_names = Some(filter_names);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &FilterEvent) -> bool {
        if let Some(ref event_types) = self.event_types {
            if !event_types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref filter_names) = self.filter_names {
            if let Some(name) = event.filter_name() {
                if !filter_names.iter().any(|n| n == name) {
                    return false;
                }
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&FilterEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<FilterEvent>,
    /// 事件监听器映射
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: FilterEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景，仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<FilterEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（`"*"` 监听所有事件）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&FilterEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<FilterEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 创建新的过滤事件接收器
    pub fn new(receiver: broadcast::Receiver<FilterEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<FilterEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<FilterEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn data_changed(partition: &str, name: &str, version: u64, value: serde_json::Value) -> FilterEvent {
        FilterEvent::DataChanged {
            partition: partition.to_string(),
            name: name.to_string(),
            version,
            value,
            timestamp: now_millis(),
        }
    }

    pub fn check_started(partition: &str, filters: Vec<String>) -> FilterEvent {
        FilterEvent::CheckStarted {
            partition: partition.to_string(),
            filters,
            timestamp: now_millis(),
        }
    }

    pub fn check_completed(partition: &str, updated: Vec<String>) -> FilterEvent {
        FilterEvent::CheckCompleted {
            partition: partition.to_string(),
            updated,
            timestamp: now_millis(),
        }
    }

    pub fn check_failed(partition: &str, error: &crate::error::FilterCacheError) -> FilterEvent {
        FilterEvent::CheckFailed {
            partition: partition.to_string(),
            error: error.to_string(),
            recoverable: error.is_recoverable(),
            timestamp: now_millis(),
        }
    }

    pub fn entries_evicted(partition: &str, names: Vec<String>) -> FilterEvent {
        FilterEvent::EntriesEvicted {
            partition: partition.to_string(),
            names,
            timestamp: now_millis(),
        }
    }

    pub fn storage_unavailable(partition: &str, reason: &str) -> FilterEvent {
        FilterEvent::StorageUnavailable {
            partition: partition.to_string(),
            reason: reason.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn push_channel_state_changed(old_state: ChannelStatus, new_state: ChannelStatus) -> FilterEvent {
        FilterEvent::PushChannelStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn update_version_received() -> FilterEvent {
        FilterEvent::UpdateVersionReceived {
            timestamp: now_millis(),
        }
    }
}
