//! 网络模块：版本检查协议与传输
//!
//! 同步器只依赖 [`FilterTransport`]，HTTP 实现见 [`http::HttpFilterTransport`]。

use async_trait::async_trait;

use crate::error::Result;

pub mod http;
pub mod protocol;

pub use http::{build_client, HttpFilterTransport};
pub use protocol::{CheckVersionRequest, FilterUpdate, VersionCheckResponse};

/// 版本检查传输（每个检查周期只调用一次）
#[async_trait]
pub trait FilterTransport: Send + Sync + std::fmt::Debug {
    async fn check_versions(&self, request: &CheckVersionRequest) -> Result<VersionCheckResponse>;
}


#[cfg(test)]
pub use test_helpers::MockTransport;
