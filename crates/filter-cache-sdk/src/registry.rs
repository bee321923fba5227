//! 过滤器注册表
//!
//! 显式构造、通过 `Arc` 注入的注册表，记录当前页面（会话）激活的过滤器及其控件选项。
//! 同步器与推送通道只通过它获取「当前激活的过滤器集合」。

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FilterCacheError, Result};

/// 版本键后缀（服务器响应中 `{name}__version`）
pub const VERSION_SUFFIX: &str = "__version";

/// 过滤器控件选项（由外部多选控件解释，SDK 只透传）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    /// 显示名称
    pub label: Option<String>,
    /// 占位提示
    pub placeholder: Option<String>,
    /// 是否允许多选
    #[serde(default)]
    pub multiple: bool,
    /// 控件扩展字段（SDK 不解析）
    pub extra: Option<serde_json::Value>,
}

impl FilterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn with_multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// 校验过滤器名称：非空、不含逗号（请求中逗号拼接）、不以 `__version` 结尾
pub fn validate_filter_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FilterCacheError::InvalidArgument("过滤器名称不能为空".to_string()));
    }
    if name.contains(',') {
        return Err(FilterCacheError::InvalidArgument(format!(
            "过滤器名称不能包含逗号: {}",
            name
        )));
    }
    if name.ends_with(VERSION_SUFFIX) {
        return Err(FilterCacheError::InvalidArgument(format!(
            "过滤器名称不能以 {} 结尾: {}",
            VERSION_SUFFIX, name
        )));
    }
    Ok(())
}

/// 过滤器注册表
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: RwLock<BTreeMap<String, FilterOptions>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册过滤器；已存在时更新选项并返回 false
    pub fn register(&self, name: &str, options: FilterOptions) -> Result<bool> {
        validate_filter_name(name)?;
        let mut filters = self.filters.write();
        let is_new = filters.insert(name.to_string(), options).is_none();
        if is_new {
            info!("过滤器已注册: {} (共 {} 个)", name, filters.len());
        } else {
            debug!("过滤器选项已更新: {}", name);
        }
        Ok(is_new)
    }

    pub fn unregister(&self, name: &str) -> Option<FilterOptions> {
        let removed = self.filters.write().remove(name);
        if removed.is_some() {
            info!("过滤器已注销: {}", name);
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.read().contains_key(name)
    }

    pub fn options(&self, name: &str) -> Option<FilterOptions> {
        self.filters.read().get(name).cloned()
    }

    /// 当前激活的过滤器集合（快照）
    pub fn active_names(&self) -> BTreeSet<String> {
        self.filters.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_snapshot() {
        let registry = FilterRegistry::new();
        assert!(registry.register("hats", FilterOptions::new()).unwrap());
        assert!(registry
            .register("dogs", FilterOptions::new().with_label("Dogs").with_multiple(true))
            .unwrap());
        assert!(!registry.register("dogs", FilterOptions::new()).unwrap());

        let names: Vec<String> = registry.active_names().into_iter().collect();
        assert_eq!(names, vec!["dogs".to_string(), "hats".to_string()]);
        assert_eq!(registry.options("dogs"), Some(FilterOptions::new()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister() {
        let registry = FilterRegistry::new();
        registry.register("dogs", FilterOptions::new()).unwrap();
        assert!(registry.unregister("dogs").is_some());
        assert!(registry.unregister("dogs").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let registry = FilterRegistry::new();
        assert!(registry.register("", FilterOptions::new()).is_err());
        assert!(registry.register("a,b", FilterOptions::new()).is_err());
        assert!(registry.register("dogs__version", FilterOptions::new()).is_err());
        assert!(registry.is_empty());
    }
}
