//! 版本同步模块
//!
//! 职责：
//! - 对比本地版本与服务器版本
//! - 只拉取过期 / 缺失的过滤器
//! - 串行化检查周期（同一时刻最多一个在途请求）
//! - 清理服务器不再下发的过滤器

pub mod synchronizer;

pub use synchronizer::CacheSynchronizer;

/// 同步状态
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncState {
    /// 尚未执行过检查
    Idle,
    /// 正在检查
    Syncing,
    /// 最近一次检查成功
    Synced {
        /// 本次更新的过滤器数量
        updated: usize,
        last_sync_at: u64,
    },
    /// 最近一次检查失败（本地缓存未改动）
    Failed {
        error: String,
        recoverable: bool,
        failed_at: u64,
    },
}

/// 单次 check_version 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// 本次请求中携带的过滤器
    pub requested: Vec<String>,
    /// 首次出现、以 version 0 登记的过滤器
    pub seeded: Vec<String>,
    /// 写入了新版本的过滤器
    pub updated: Vec<String>,
    /// 响应中被忽略的条目（非激活、版本回退或缺少值）
    pub ignored: Vec<String>,
    /// schema 版本不一致时清理掉的过滤器
    pub evicted: Vec<String>,
}

impl CheckOutcome {
    /// 服务器报告没有任何需要更新的过滤器
    pub fn is_unchanged(&self) -> bool {
        self.updated.is_empty()
    }
}

/// 同步统计
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub checks_started: u64,
    pub checks_completed: u64,
    pub checks_failed: u64,
    pub records_updated: u64,
    pub records_evicted: u64,
    pub last_check_at: Option<u64>,
}
