//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 安装 fmt 日志订阅器
///
/// 优先使用 `RUST_LOG`；未设置时 debug_mode 下为 `debug`，否则为 `info`。
/// 重复调用（或宿主已安装订阅器）时返回 false。
pub fn init_logging(debug_mode: bool) -> bool {
    let default_level = if debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug_mode)
        .try_init()
        .is_ok()
}
