//! Filter Cache SDK 基础使用示例
//!
//! 演示流程：
//! 1. 加载配置（可选 TOML 文件）并初始化 SDK
//! 2. 注册过滤器控件，订阅数据更新
//! 3. 执行一次版本检查，打印下拉选项
//! 4. 打开推送通道，等待 updateVersion 推送
//! 5. Ctrl+C 后关闭
//!
//! 运行：`cargo run --example basic -- [config.toml]`

use filter_cache_sdk::{init_logging, FilterCacheConfig, FilterCacheSDK, FilterOptions, Result};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => FilterCacheConfig::from_toml_file(path)?,
        None => FilterCacheConfig::builder()
            .data_dir("/tmp/filter_cache_basic_demo")
            .partition("eu1")
            .check_url("http://127.0.0.1:8080/filters/check-version")
            .push_url("http://127.0.0.1:8080/filters/push")
            .debug_mode(true)
            .build(),
    };
    init_logging(config.debug_mode);

    info!("🚀 Filter Cache SDK 基础示例");
    info!("========================================\n");

    info!("📝 步骤 1: 初始化 SDK (partition={})", config.partition);
    let sdk = FilterCacheSDK::initialize(config).await?;

    info!("📝 步骤 2: 注册过滤器");
    sdk.add_filter("dogs", FilterOptions::new().with_label("Dogs").with_multiple(true))?;
    sdk.add_filter("hats", FilterOptions::new().with_label("Hats"))?;
    sdk.on_data_changed(|name, value| {
        info!("🔔 过滤器 {} 已更新: {}", name, value);
    })
    .await;

    info!("📝 步骤 3: 版本检查");
    match sdk.check_now().await {
        Ok(outcome) => info!("✅ 检查完成，更新: {:?}", outcome.updated),
        Err(e) if e.is_recoverable() => warn!("⚠️ 检查失败，继续使用本地缓存: {}", e),
        Err(e) => return Err(e),
    }
    for name in ["dogs", "hats"] {
        let options = sdk.get_options(name).await;
        info!("  {} 共 {} 个选项", name, options.len());
        for option in options {
            info!("    - {} ({})", option.label, option.value);
        }
    }

    info!("📝 步骤 4: 打开推送通道 (session={})", sdk.session_id());
    sdk.open_push_channel().await?;

    info!("等待推送，按 Ctrl+C 退出...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听 Ctrl+C 失败: {}", e);
    }

    info!("📝 步骤 5: 关闭");
    sdk.shutdown().await?;
    info!("👋 示例结束");
    Ok(())
}
