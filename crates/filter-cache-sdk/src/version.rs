//! SDK 版本与存储 schema 版本
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Store Schema Version** → 本模块常量，写入每个分区的 `__meta:schema_version`

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 当前 SDK 使用的分区存储 schema 版本。
///
/// 分区内记录的版本与此不一致时（升级或降级），VersionStore 标记为「epoch 不匹配」，
/// 下一次 check_version 前先执行过期条目清理，而不是直接报错。
///
/// 2：version 索引与完整记录合并为同一批次写入（取代旧的双表分别写入）。
pub const STORE_SCHEMA_VERSION: u32 = 2;
