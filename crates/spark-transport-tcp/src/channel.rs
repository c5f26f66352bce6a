use std::io;
use std::net::Shutdown as StdShutdown;

use async_trait::async_trait;
use socket2::SockRef;
use spark_transport::{
    IoContext, Result, ShutdownDirection, TransportError, TransportSocketAddr, TwoWayStream,
    run_with_context,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error;

/// 单条 TCP 连接上的双向流。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端口单元独占自己的连接：输出单元顺序写消息再读确认，输入单元阻塞读消息再写回复，
///   读写半部拆开后无需任何互斥锁；
/// - 强制中断通过 [`IoContext`] 传入，调用方不需要了解 Tokio 具体类型。
///
/// ## 逻辑 (How)
/// - `from_stream` 打开 `TCP_NODELAY` 后 `into_split`；
/// - 读到 EOF、IO 失败或被中断后，对应方向标记为关闭，`is_ok` 随之变为 `false`；
/// - 读方向的半关闭通过 `socket2::SockRef` 完成。
///
/// ## 契约 (What)
/// - `connect`：在上下文的中断/超时语义下建立连接；
/// - 实现 [`TwoWayStream`] 的全部方法，重复 `shutdown` 不报错。
///
/// ## 注意事项 (Trade-offs)
/// - 一旦被中断，连接不可恢复；需要重新建连。
#[derive(Debug)]
pub struct TcpChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    local_addr: TransportSocketAddr,
    peer_addr: TransportSocketAddr,
    read_open: bool,
    write_open: bool,
}

impl TcpChannel {
    pub(crate) fn from_stream(stream: TokioTcpStream) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|err| error::CONFIGURE.io_error(err))?;
        let local = stream
            .local_addr()
            .map_err(|err| error::CONFIGURE.io_error(err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| error::CONFIGURE.io_error(err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            local_addr: local.into(),
            peer_addr: peer.into(),
            read_open: true,
            write_open: true,
        })
    }

    /// 根据上下文建立到目标地址的连接。
    pub async fn connect(ctx: &IoContext, addr: TransportSocketAddr) -> Result<Self> {
        let target = std::net::SocketAddr::from(addr);
        let stream = run_with_context(ctx, error::CONNECT, TokioTcpStream::connect(target)).await?;
        tracing::debug!(peer = %addr, "tcp connected");
        Self::from_stream(stream)
    }

    /// 本地地址。
    pub fn local_socket_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    /// 对端地址。
    pub fn peer_socket_addr(&self) -> TransportSocketAddr {
        self.peer_addr
    }

    fn mark_failed(&mut self, err: &TransportError) {
        if err.is_interrupted() {
            self.read_open = false;
            self.write_open = false;
        }
    }
}

#[async_trait]
impl TwoWayStream for TcpChannel {
    async fn read(&mut self, ctx: &IoContext, buf: &mut [u8]) -> Result<usize> {
        if !self.read_open {
            return Err(error::READ.closed());
        }
        match run_with_context(ctx, error::READ, self.reader.read(buf)).await {
            Ok(0) if !buf.is_empty() => {
                self.read_open = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.read_open = false;
                self.mark_failed(&err);
                Err(err)
            }
        }
    }

    async fn write_all(&mut self, ctx: &IoContext, buf: &[u8]) -> Result<()> {
        if !self.write_open {
            return Err(error::WRITE.closed());
        }
        if buf.is_empty() {
            return Ok(());
        }
        let result = run_with_context(ctx, error::WRITE, self.writer.write_all(buf)).await;
        if let Err(err) = &result {
            self.write_open = false;
            self.mark_failed(err);
        }
        result
    }

    async fn flush(&mut self, ctx: &IoContext) -> Result<()> {
        if !self.write_open {
            return Err(error::WRITE.closed());
        }
        run_with_context(ctx, error::WRITE, self.writer.flush()).await
    }

    async fn shutdown(&mut self, ctx: &IoContext, direction: ShutdownDirection) -> Result<()> {
        let write = matches!(direction, ShutdownDirection::Write | ShutdownDirection::Both);
        let read = matches!(direction, ShutdownDirection::Read | ShutdownDirection::Both);

        if write && self.write_open {
            self.write_open = false;
            // 已被中断的上下文无法再执行异步关闭，直接走同步路径。
            let graceful = if ctx.is_interrupted() {
                sync_shutdown(&self.reader, StdShutdown::Write)
                    .map_err(|err| error::SHUTDOWN.io_error(err))
            } else {
                run_with_context(ctx, error::SHUTDOWN, self.writer.shutdown()).await
            };
            ignore_disconnected(graceful)?;
        }
        if read && self.read_open {
            self.read_open = false;
            ignore_disconnected(
                sync_shutdown(&self.reader, StdShutdown::Read)
                    .map_err(|err| error::SHUTDOWN.io_error(err)),
            )?;
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.local_addr)
    }

    fn peer_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.peer_addr)
    }

    fn is_ok(&self) -> bool {
        self.read_open && self.write_open
    }
}

fn sync_shutdown(reader: &OwnedReadHalf, how: StdShutdown) -> io::Result<()> {
    let stream: &TokioTcpStream = reader.as_ref();
    SockRef::from(stream).shutdown(how)
}

/// 对端先挂断时关闭会得到 `NotConnected`，关闭目标已经达成。
fn ignore_disconnected(result: Result<()>) -> Result<()> {
    match result {
        Err(err)
            if matches!(
                err.category(),
                spark_transport::ErrorCategory::Retryable
                    | spark_transport::ErrorCategory::Interrupted
                    | spark_transport::ErrorCategory::Closed
            ) =>
        {
            Ok(())
        }
        other => other,
    }
}
