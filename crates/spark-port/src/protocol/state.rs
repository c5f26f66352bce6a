use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use spark_transport::{
    InterruptHandle, IoContext, OperationKind, ShutdownDirection, TransportSocketAddr,
    TwoWayStream,
};

use crate::contact::Route;
use crate::error::{PortError, Result};

const READ: OperationKind =
    OperationKind::new("spark.port.stream.read_failed", "connection read");
const NO_STREAM: OperationKind =
    OperationKind::new("spark.port.stream.missing", "connection has no stream");

const STREAM_CHUNK: usize = 8 * 1024;
const PACKET_CHUNK: usize = 64 * 1024;
const MAX_LINE: usize = 64 * 1024;

/// 连接阶段。
///
/// # 教案式注释
/// - **意图 (Why)**：同一条连接在握手、索引、负载、回复之间切换，每一步只由一方驱动；
///   显式状态让越序调用（例如握手未完成就写负载）立刻暴露；
/// - **契约 (What)**：`Closed` 可从任意阶段进入；负载结束后回到 `IndexExchanged`
///   等待下一条消息。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    HeaderPending,
    CarrierNegotiated,
    IndexExchanged,
    PayloadStreaming,
    ReplyPending,
    Closed,
}

impl ConnectionPhase {
    pub fn can_transition_to(self, target: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, target),
            (_, Closed)
                | (HeaderPending, CarrierNegotiated)
                | (CarrierNegotiated, IndexExchanged)
                | (IndexExchanged, PayloadStreaming)
                | (PayloadStreaming, ReplyPending)
                | (PayloadStreaming, IndexExchanged)
                | (ReplyPending, IndexExchanged)
        )
    }
}

/// 单条连接的流与缓冲。
///
/// 握手前由 Protocol 持有，握手中交给 Carrier 读写；`take_streams` 允许 Carrier
/// 把引导流替换为专用流。读取经过内部缓冲，以支持按行与按长度读取。
#[derive(Debug)]
pub struct ConnectionState {
    stream: Option<Box<dyn TwoWayStream>>,
    ctx: IoContext,
    route: Route,
    phase: ConnectionPhase,
    read_buf: BytesMut,
}

impl ConnectionState {
    pub fn new(stream: Box<dyn TwoWayStream>, ctx: IoContext) -> Self {
        Self {
            stream: Some(stream),
            ctx,
            route: Route::default(),
            phase: ConnectionPhase::HeaderPending,
            read_buf: BytesMut::new(),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// 推进阶段；非法跃迁返回 [`PortError::InvalidPhase`]。
    pub fn advance(&mut self, target: ConnectionPhase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(PortError::InvalidPhase {
                from: self.phase,
                to: target,
            });
        }
        self.phase = target;
        Ok(())
    }

    pub fn ctx(&self) -> &IoContext {
        &self.ctx
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.ctx.interrupt_handle().clone()
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.ctx = self.ctx.clone().with_timeout(timeout);
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn TwoWayStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| PortError::from(NO_STREAM.closed()))
    }

    /// 当前底层流。
    pub fn streams(&self) -> Option<&dyn TwoWayStream> {
        self.stream.as_deref()
    }

    /// 流是否仍可用。
    pub fn check_streams(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| stream.is_ok())
    }

    pub fn is_packetized(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.is_packetized())
    }

    pub fn local_addr(&self) -> Option<TransportSocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.local_addr())
    }

    pub fn peer_addr(&self) -> Option<TransportSocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.peer_addr())
    }

    async fn fill(&mut self) -> Result<()> {
        let chunk = if self.is_packetized() {
            PACKET_CHUNK
        } else {
            STREAM_CHUNK
        };
        let ctx = self.ctx.clone();
        let mut scratch = vec![0u8; chunk];
        let n = self.stream_mut()?.read(&ctx, &mut scratch).await?;
        if n == 0 {
            return Err(READ.closed().into());
        }
        self.read_buf.extend_from_slice(&scratch[..n]);
        Ok(())
    }

    /// 精确读取 `len` 字节。
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        while self.read_buf.len() < len {
            self.fill().await?;
        }
        Ok(self.read_buf.split_to(len).freeze())
    }

    /// 读取一行，去掉 `\r\n` 或 `\n`。
    pub async fn read_line(&mut self) -> Result<String> {
        let mut scanned = 0;
        loop {
            if let Some(at) = self.read_buf[scanned..].iter().position(|b| *b == b'\n') {
                let raw = self.read_buf.split_to(scanned + at + 1);
                let mut line = &raw[..raw.len() - 1];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                return String::from_utf8(line.to_vec())
                    .map_err(|_| PortError::protocol("line is not valid utf-8"));
            }
            scanned = self.read_buf.len();
            if scanned > MAX_LINE {
                return Err(PortError::protocol("line too long"));
            }
            self.fill().await?;
        }
    }

    /// 报文型流上丢弃上一条消息未读完的字节。
    pub fn discard_residue(&mut self) {
        if self.is_packetized() && self.read_buf.has_remaining() {
            tracing::debug!(bytes = self.read_buf.len(), "discarding datagram residue");
            self.read_buf.clear();
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let ctx = self.ctx.clone();
        self.stream_mut()?.write_all(&ctx, data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        self.stream_mut()?.flush(&ctx).await?;
        Ok(())
    }

    pub fn begin_packet(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.begin_packet();
        }
    }

    pub async fn end_packet(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        self.stream_mut()?.end_packet(&ctx).await?;
        Ok(())
    }

    /// 替换底层流。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：先刷新并关闭旧流，再清空读缓冲，最后安装新流；旧流的残留字节
    ///   绝不会被当作新流的数据读出；
    /// - **契约 (What)**：旧流关闭失败只记录日志，新流照常安装。
    pub async fn take_streams(&mut self, stream: Box<dyn TwoWayStream>) -> Result<()> {
        if let Some(mut old) = self.stream.take() {
            let ctx = self.ctx.clone();
            if let Err(err) = old.flush(&ctx).await {
                tracing::debug!(code = err.code(), "flushing replaced stream failed");
            }
            if let Err(err) = old.shutdown(&ctx, ShutdownDirection::Both).await {
                tracing::debug!(code = err.code(), "closing replaced stream failed");
            }
        }
        self.read_buf.clear();
        self.stream = Some(stream);
        Ok(())
    }

    /// 关闭流；可重复调用。
    pub async fn shutdown(&mut self) {
        let ctx = IoContext::new().with_timeout(Some(Duration::from_millis(500)));
        if let Some(stream) = self.stream.as_mut()
            && let Err(err) = stream.shutdown(&ctx, ShutdownDirection::Both).await
        {
            tracing::debug!(code = err.code(), "stream shutdown failed");
        }
        self.read_buf.clear();
    }
}
