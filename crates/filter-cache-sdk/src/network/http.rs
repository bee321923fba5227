//! HTTP 版本检查传输 - 基于 reqwest

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error, info};

use crate::error::{FilterCacheError, Result};
use crate::network::protocol::{CheckVersionRequest, VersionCheckResponse};
use crate::network::FilterTransport;
use crate::sdk::HttpClientConfig;

/// 构建带超时配置的 reqwest 客户端（检查请求与推送通道共用）
pub fn build_client(config: &HttpClientConfig) -> Result<Client> {
    let mut builder = Client::builder();

    if let Some(timeout) = config.connect_timeout_secs {
        builder = builder.connect_timeout(Duration::from_secs(timeout));
    }

    if let Some(agent) = &config.user_agent {
        builder = builder.user_agent(agent.clone());
    }

    builder
        .build()
        .map_err(|e| FilterCacheError::Config(format!("创建 HTTP 客户端失败: {}", e)))
}

/// HTTP 版本检查客户端
#[derive(Debug, Clone)]
pub struct HttpFilterTransport {
    client: Client,
    check_url: String,
    request_timeout: Option<Duration>,
}

impl HttpFilterTransport {
    /// 创建新的 HTTP 传输
    pub fn new(config: &HttpClientConfig, check_url: impl Into<String>) -> Result<Self> {
        let client = build_client(config)?;
        let check_url = check_url.into();

        info!("✅ HTTP 传输已创建 (check_url: {})", check_url);

        Ok(Self {
            client,
            check_url,
            request_timeout: config.request_timeout_secs.map(Duration::from_secs),
        })
    }

    /// 复用已有的 reqwest 客户端
    pub fn with_client(client: Client, check_url: impl Into<String>) -> Self {
        Self {
            client,
            check_url: check_url.into(),
            request_timeout: None,
        }
    }

    pub fn check_url(&self) -> &str {
        &self.check_url
    }
}

#[async_trait]
impl FilterTransport for HttpFilterTransport {
    async fn check_versions(&self, request: &CheckVersionRequest) -> Result<VersionCheckResponse> {
        debug!(
            "发送版本检查: partition={}, filters={}",
            request.partition, request.filters
        );

        let mut builder = self.client.post(&self.check_url).json(request);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FilterCacheError::Timeout(format!("版本检查请求超时: {}", e))
            } else {
                FilterCacheError::Transport(format!("版本检查请求失败: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 版本检查失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(FilterCacheError::Transport(format!(
                "版本检查失败，HTTP 状态码: {} ({})",
                status, error_text
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FilterCacheError::Transport(format!("读取版本检查响应失败: {}", e)))?;

        VersionCheckResponse::from_slice(&bytes)
    }
}
