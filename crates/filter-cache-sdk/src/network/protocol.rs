//! 版本检查协议
//!
//! 请求：`{ "partition": "eu1", "filters": "dogs,hats", "versions": {"dogs": 0, "hats": 0} }`
//!
//! 响应：JSON 对象，键为 `{name}__version`（整数）或 `{name}`（不透明值），
//! 空对象表示没有需要更新的过滤器。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FilterCacheError, Result};
use crate::registry::VERSION_SUFFIX;

/// 版本检查请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVersionRequest {
    /// 分区标识
    pub partition: String,
    /// 逗号拼接的过滤器名称
    pub filters: String,
    /// 过滤器 → 本地版本
    pub versions: BTreeMap<String, u64>,
}

impl CheckVersionRequest {
    pub fn new(partition: impl Into<String>, versions: BTreeMap<String, u64>) -> Self {
        let filters = versions.keys().cloned().collect::<Vec<_>>().join(",");
        Self {
            partition: partition.into(),
            filters,
            versions,
        }
    }

    pub fn filter_names(&self) -> BTreeSet<String> {
        self.versions.keys().cloned().collect()
    }
}

/// 单个过滤器的服务器更新
#[derive(Debug, Clone, PartialEq)]
pub struct FilterUpdate {
    pub name: String,
    pub version: u64,
    /// 服务器未随版本一起下发值时为 None
    pub value: Option<serde_json::Value>,
}

/// 解析后的版本检查响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionCheckResponse {
    /// 按名称排序的更新
    pub updates: Vec<FilterUpdate>,
    /// 只有值、没有对应版本键的条目
    pub orphan_values: BTreeMap<String, serde_json::Value>,
}

fn parse_version(name: &str, value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().ok_or_else(|| {
            FilterCacheError::InvalidResponse(format!("{} 的版本不是非负整数: {}", name, n))
        }),
        serde_json::Value::String(s) => s.trim().parse::<u64>().map_err(|_| {
            FilterCacheError::InvalidResponse(format!("{} 的版本不是整数: {:?}", name, s))
        }),
        other => Err(FilterCacheError::InvalidResponse(format!(
            "{} 的版本类型无效: {}",
            name, other
        ))),
    }
}

impl VersionCheckResponse {
    /// 从服务器返回的 JSON 解析
    pub fn from_json(body: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(entries) = body else {
            return Err(FilterCacheError::InvalidResponse(
                "版本检查响应必须是 JSON 对象".to_string(),
            ));
        };

        let mut versions: BTreeMap<String, u64> = BTreeMap::new();
        let mut values: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        for (key, value) in entries {
            match key.strip_suffix(VERSION_SUFFIX) {
                Some(name) if !name.is_empty() => {
                    let version = parse_version(name, &value)?;
                    versions.insert(name.to_string(), version);
                }
                _ => {
                    values.insert(key, value);
                }
            }
        }

        let mut updates = Vec::with_capacity(versions.len());
        for (name, version) in versions {
            let value = values.remove(&name);
            updates.push(FilterUpdate {
                name,
                version,
                value,
            });
        }

        if !values.is_empty() {
            warn!(
                "响应中存在没有版本号的值，已忽略: {:?}",
                values.keys().collect::<Vec<_>>()
            );
        }

        Ok(Self {
            updates,
            orphan_values: values,
        })
    }

    /// 从原始字节解析
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }
        let body: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| FilterCacheError::InvalidResponse(format!("响应不是合法 JSON: {}", e)))?;
        Self::from_json(body)
    }

    /// 服务器认为没有需要更新的过滤器
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
