//! 过滤器控件适配层
//!
//! 把缓存中的过滤器值转换为下拉控件可用的选项，并在数据更新时通知控件。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{EventManager, FilterEvent};
use crate::registry::{FilterOptions, FilterRegistry};
use crate::storage::VersionStore;

/// 下拉选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }

    /// 从缓存值派生选项
    ///
    /// 支持三种形状：
    /// - 标量数组：`["Poodle", "Dalmation"]`
    /// - 对象数组：`[{"value": "p", "label": "Poodle"}]`（缺少 label 时用 value）
    /// - 对象映射：`{"p": "Poodle"}`
    pub fn from_value(value: &Value) -> Vec<SelectOption> {
        match value {
            Value::Array(items) => items.iter().filter_map(Self::from_item).collect(),
            Value::Object(map) => map
                .iter()
                .map(|(key, label)| SelectOption::new(key.clone(), scalar_text(label).unwrap_or_else(|| key.clone())))
                .collect(),
            Value::Null => Vec::new(),
            other => match scalar_text(other) {
                Some(text) => vec![SelectOption::new(text.clone(), text)],
                None => Vec::new(),
            },
        }
    }

    fn from_item(item: &Value) -> Option<SelectOption> {
        match item {
            Value::Object(obj) => {
                let value = obj.get("value").and_then(scalar_text)?;
                let label = obj
                    .get("label")
                    .and_then(scalar_text)
                    .unwrap_or_else(|| value.clone());
                Some(SelectOption::new(value, label))
            }
            other => {
                let text = scalar_text(other)?;
                Some(SelectOption::new(text.clone(), text))
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 过滤器控件适配器
#[derive(Debug, Clone)]
pub struct FilterWidgetAdapter {
    store: Arc<VersionStore>,
    registry: Arc<FilterRegistry>,
    events: Arc<EventManager>,
}

impl FilterWidgetAdapter {
    pub fn new(store: Arc<VersionStore>, registry: Arc<FilterRegistry>, events: Arc<EventManager>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    /// 注册过滤器控件，返回是否为新过滤器
    pub fn add_filter(&self, name: &str, options: FilterOptions) -> Result<bool> {
        let added = self.registry.register(name, options)?;
        debug!("注册过滤器控件: name={}, new={}", name, added);
        Ok(added)
    }

    pub fn filter_options(&self, name: &str) -> Option<FilterOptions> {
        self.registry.options(name)
    }

    /// 读取缓存值；不存在、尚未拉取或读取失败时返回 None
    pub async fn get_value(&self, name: &str) -> Option<Value> {
        match self.store.get(name).await {
            Ok(Some(record)) if record.is_fetched() => Some(record.value),
            Ok(_) => None,
            Err(e) => {
                warn!("读取过滤器值失败: name={}, error={}", name, e);
                None
            }
        }
    }

    pub async fn get_options(&self, name: &str) -> Vec<SelectOption> {
        self.get_value(name)
            .await
            .map(|value| SelectOption::from_value(&value))
            .unwrap_or_default()
    }

    /// 数据写入后回调 `(name, value)`
    pub async fn on_data_changed<F>(&self, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.events
            .add_listener("data_changed", move |event| {
                if let FilterEvent::DataChanged { name, value, .. } = event {
                    callback(name, value);
                }
            })
            .await;
    }
}
