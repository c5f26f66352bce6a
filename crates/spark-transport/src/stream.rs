use std::fmt;

use async_trait::async_trait;

use crate::{IoContext, Result, TransportSocketAddr};

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

/// Carrier 驱动的双向字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Protocol 在握手前持有原始流，握手后交给 Carrier；某些 Carrier（如 UDP）还会用
///   `takeStreams` 把引导用的 TCP 流替换为专用流，因此需要一个可装箱的统一接口；
/// - 每个单元独占自己的流，方法以 `&mut self` 表达独占，无需内部互斥锁。
///
/// ## 逻辑（How）
/// - 所有 IO 方法接收 [`IoContext`]，实现应通过 [`run_with_context`](crate::run_with_context)
///   包装底层 Future，使强制中断与超时在每次阻塞点生效；
/// - 报文型流（UDP）在 `begin_packet`/`end_packet` 之间累积写入，`end_packet` 时整体发出。
///
/// ## 契约（What）
/// - `read` 返回 `Ok(0)` 表示对端关闭；
/// - `write_all` 要么写完整个缓冲区，要么返回错误；
/// - `is_ok` 为 `false` 后流不可再用，Protocol 的 `check_streams` 以此判断存活；
/// - `shutdown` 可重复调用，重复调用不得报错。
#[async_trait]
pub trait TwoWayStream: Send + fmt::Debug {
    /// 读取至多 `buf.len()` 字节。
    async fn read(&mut self, ctx: &IoContext, buf: &mut [u8]) -> Result<usize>;

    /// 写出整个缓冲区。
    async fn write_all(&mut self, ctx: &IoContext, buf: &[u8]) -> Result<()>;

    /// 刷新内部缓冲。
    async fn flush(&mut self, ctx: &IoContext) -> Result<()>;

    /// 标记一条消息的开始；字节流实现无需处理。
    fn begin_packet(&mut self) {}

    /// 标记一条消息的结束；报文型实现在此发出累积的数据。
    async fn end_packet(&mut self, _ctx: &IoContext) -> Result<()> {
        Ok(())
    }

    /// 半关闭或全关闭。
    async fn shutdown(&mut self, ctx: &IoContext, direction: ShutdownDirection) -> Result<()>;

    fn local_addr(&self) -> Option<TransportSocketAddr>;

    fn peer_addr(&self) -> Option<TransportSocketAddr>;

    /// 流是否仍可用。
    fn is_ok(&self) -> bool;

    /// 是否以报文为单位收发。报文型流在每条消息开始时丢弃上一条残留的字节。
    fn is_packetized(&self) -> bool {
        false
    }
}
