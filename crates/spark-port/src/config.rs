//! 端口配置：握手超时、默认 Carrier、写入阻塞策略、端口标志。
//!
//! 配置通常随进程启动从 TOML 读取，缺省字段取 [`PortConfig::default`] 中的值。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PortError, Result};

/// 端口允许的连接方向。
///
/// RPC 端口最多只有一个输出连接，且每次写入都期待回复。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PortFlags {
    pub input: bool,
    pub output: bool,
    pub rpc: bool,
}

impl Default for PortFlags {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
            rpc: false,
        }
    }
}

impl PortFlags {
    /// RPC 客户端：单一输出，写入等待回复。
    pub fn rpc() -> Self {
        Self {
            rpc: true,
            ..Self::default()
        }
    }
}

/// 单个端口的运行参数。
///
/// # 教案式说明
/// - **意图 (Why)**：写入方是否等待、握手能等多久等策略属于部署决策，不应硬编码在核心里；
/// - **契约 (What)**：
///   - `timeout_ms` 作用于建连与握手，`0` 表示不限时；握手完成后连接上的读写不再限时；
///   - `wait_before_send = false` 时，忙碌的输出连接会跳过新消息；
///   - `wait_after_send = true` 时，`send` 在所有连接写完后才返回；
///   - `input_queue` 为投递队列容量，必须大于 0。
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    pub timeout_ms: u64,
    pub default_carrier: String,
    pub wait_before_send: bool,
    pub wait_after_send: bool,
    pub input_queue: usize,
    pub close_grace_ms: u64,
    pub flags: PortFlags,
    pub host: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            default_carrier: "tcp".to_owned(),
            wait_before_send: true,
            wait_after_send: true,
            input_queue: 64,
            close_grace_ms: 2_000,
            flags: PortFlags::default(),
            host: "127.0.0.1".to_owned(),
        }
    }
}

impl PortConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PortConfig = toml::from_str(text).map_err(|err| PortError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| PortError::Config {
            detail: format!("cannot read {}: {err}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_queue == 0 {
            return Err(PortError::Config {
                detail: "input_queue must be greater than zero".to_owned(),
            });
        }
        if self.default_carrier.trim().is_empty() {
            return Err(PortError::Config {
                detail: "default_carrier must not be empty".to_owned(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(PortError::Config {
                detail: "host must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// 建连与握手的等待上限。
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PortConfig::from_toml_str(
            r#"
            default_carrier = "fast_tcp"
            wait_before_send = false

            [flags]
            rpc = true
            "#,
        )
        .expect("部分字段的 TOML 应可解析");
        assert_eq!(config.default_carrier, "fast_tcp");
        assert!(!config.wait_before_send);
        assert!(config.wait_after_send);
        assert!(config.flags.rpc && config.flags.input && config.flags.output);
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = PortConfig::from_toml_str("input_queue = 0").expect_err("队列容量为 0 应被拒绝");
        assert_eq!(err.code(), "spark.port.config.invalid");
        assert!(PortConfig::from_toml_str("timeout_ms = \"soon\"").is_err());
        let unbounded = PortConfig::from_toml_str("timeout_ms = 0").expect("0 表示不限时");
        assert_eq!(unbounded.timeout(), None);
    }
}
