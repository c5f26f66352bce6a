#![deny(unsafe_code)]
#![doc = "spark-transport: 端口连接核心的双向字节流契约层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：Carrier 握手与消息帧只依赖“可读、可写、可被强制关闭”的字节流，TCP、UDP 等实现需共享同一语言。"]
#![doc = "- **What**：定义 [`TwoWayStream`]、[`IoContext`]/[`InterruptHandle`]、[`TransportError`] 以及 [`TransportSocketAddr`]。"]
#![doc = "- **How**：实现 crate（`spark-transport-tcp`、`spark-transport-udp`）只需依赖本 crate，并通过 [`run_with_context`] 统一注入中断与超时。"]

pub mod addr;
pub mod context;
pub mod error;
pub mod memory;
pub mod stream;

pub use addr::TransportSocketAddr;
pub use context::{InterruptHandle, IoContext, run_with_context};
pub use error::{ErrorCategory, OperationKind, TransportError};
pub use memory::MemoryStream;
pub use stream::{ShutdownDirection, TwoWayStream};

/// 传输层统一返回别名，错误类型固定为 [`TransportError`]。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;
