//! 日志初始化辅助。
//!
//! 端口核心只通过 `tracing` 宏输出结构化事件（字段 `port`、`route`、`carrier`）；
//! 是否安装全局 Subscriber 由宿主决定，本模块提供一个开箱即用的组合。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 安装 `fmt + EnvFilter` 全局 Subscriber。
///
/// # 教案式说明
/// - **逻辑 (How)**：优先读取 `RUST_LOG`，缺失或非法时回退到 `default_filter`；
/// - **契约 (What)**：可重复调用；已有全局 Subscriber 时返回 `false` 且不做任何修改。
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(build_env_filter(default_filter))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

fn build_env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
