//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 端口核心对外暴露的失败都汇总在 [`PortError`]：握手失败、名字解析失败、协议违例、
//!   端口状态不允许等；
//! - 传输层错误原样包裹，保留稳定错误码与分类，便于日志检索。
//!
//! ## 设计要求（What）
//! - 每个变体都有 `code()` 返回的稳定字符串，前缀为 `spark.port.`；
//! - 单个连接在扇出路径上的 IO 失败不会以错误形式返回给写入方，只会记录日志并剪除该连接。

use spark_transport::TransportError;
use thiserror::Error;

use crate::protocol::ConnectionPhase;

/// 端口核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方可见的操作（`open`、`connect`、带回复的 `write`）需要明确失败原因；
///   握手路径上的错误还要区分“对方不是端口”与“网络不可达”。
/// - **契约 (What)**：所有变体 `Send + Sync + 'static`；`Transport` 透明包裹下层错误。
#[derive(Debug, Error)]
pub enum PortError {
    /// 底层流读写失败。
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 收到的 8 字节头不被任何已注册 Carrier 识别。
    #[error("no registered carrier recognises header {header:02x?}")]
    HeaderMismatch { header: [u8; 8] },

    /// 按名称查找 Carrier 失败。
    #[error("carrier `{name}` is not registered")]
    UnknownCarrier { name: String },

    /// 握手过程中对端给出的数据不合法。
    #[error("handshake failed: {detail}")]
    Handshake { detail: String },

    /// 解析消息时遇到意外的标签或长度。
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// 连接状态机拒绝非法跃迁。
    #[error("invalid connection phase transition {from:?} -> {to:?}")]
    InvalidPhase {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },

    /// 名字服务中不存在该端口。
    #[error("Do not know how to connect to {name}")]
    NameNotFound { name: String },

    /// 名字已被其它端口占用。
    #[error("name `{name}` is already registered")]
    NameInUse { name: String },

    /// 建连或握手失败。
    #[error("Cannot connect to {target}: {detail}")]
    ConnectionRefused { target: String, detail: String },

    /// 端口标志不允许该连接（例如 RPC 端口已存在输出）。
    #[error("{detail}")]
    NotAllowed { detail: String },

    /// 要删除的连接不存在。
    #[error("{detail}")]
    NotConnected { detail: String },

    /// 带回复的写入没有收到回复。
    #[error("no reply received on port `{port}`")]
    NoReply { port: String },

    /// 端口处于中断状态。
    #[error("port `{port}` is interrupted")]
    Interrupted { port: String },

    /// 端口或单元已关闭。
    #[error("`{name}` is closed")]
    Closed { name: String },

    /// 过期的数据包句柄。
    #[error("packet handle {index}:{generation} is stale")]
    StalePacket { index: u32, generation: u32 },

    /// 配置无效。
    #[error("invalid configuration: {detail}")]
    Config { detail: String },
}

impl PortError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PortError::Transport(err) => err.code(),
            PortError::HeaderMismatch { .. } => "spark.port.carrier.header_mismatch",
            PortError::UnknownCarrier { .. } => "spark.port.carrier.unknown",
            PortError::Handshake { .. } => "spark.port.handshake.invalid",
            PortError::Protocol { .. } => "spark.port.protocol.violation",
            PortError::InvalidPhase { .. } => "spark.port.protocol.invalid_phase",
            PortError::NameNotFound { .. } => "spark.port.name.not_found",
            PortError::NameInUse { .. } => "spark.port.name.in_use",
            PortError::ConnectionRefused { .. } => "spark.port.connect.refused",
            PortError::NotAllowed { .. } => "spark.port.connect.not_allowed",
            PortError::NotConnected { .. } => "spark.port.connect.missing",
            PortError::NoReply { .. } => "spark.port.rpc.no_reply",
            PortError::Interrupted { .. } => "spark.port.interrupted",
            PortError::Closed { .. } => "spark.port.closed",
            PortError::StalePacket { .. } => "spark.port.packet.stale",
            PortError::Config { .. } => "spark.port.config.invalid",
        }
    }

    /// 构造协议违例错误。
    pub fn protocol(detail: impl Into<String>) -> Self {
        PortError::Protocol {
            detail: detail.into(),
        }
    }

    /// 构造握手错误。
    pub fn handshake(detail: impl Into<String>) -> Self {
        PortError::Handshake {
            detail: detail.into(),
        }
    }

    /// 是否由流的强制中断引起。
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PortError::Transport(err) if err.is_interrupted())
    }
}

/// 端口核心统一返回别名。
pub type Result<T, E = PortError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_namespaced() {
        let errors = [
            PortError::protocol("short block"),
            PortError::NameNotFound { name: "/r".into() },
            PortError::StalePacket {
                index: 1,
                generation: 2,
            },
        ];
        for err in &errors {
            assert!(err.code().starts_with("spark.port."), "{}", err.code());
        }
        assert_eq!(
            errors[1].to_string(),
            "Do not know how to connect to /r"
        );
    }
}
