use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::OperationKind;
use crate::{IoContext, Result, ShutdownDirection, TransportSocketAddr, TwoWayStream, run_with_context};

const READ: OperationKind = OperationKind::new("spark.transport.memory.read_failed", "memory read");
const WRITE: OperationKind =
    OperationKind::new("spark.transport.memory.write_failed", "memory write");
const SHUTDOWN: OperationKind =
    OperationKind::new("spark.transport.memory.shutdown_failed", "memory shutdown");

/// 进程内的双向内存流。
///
/// 同一进程内的两端以 `tokio::io::duplex` 相连，用于无需真实套接字的握手与帧测试，
/// 也可作为进程内端口互联的底座。
#[derive(Debug)]
pub struct MemoryStream {
    inner: DuplexStream,
    open: bool,
}

impl MemoryStream {
    /// 创建一对互联的流，`capacity` 为单方向的缓冲上限。
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(capacity);
        (
            Self {
                inner: left,
                open: true,
            },
            Self {
                inner: right,
                open: true,
            },
        )
    }
}

#[async_trait]
impl TwoWayStream for MemoryStream {
    async fn read(&mut self, ctx: &IoContext, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(READ.closed());
        }
        run_with_context(ctx, READ, self.inner.read(buf)).await
    }

    async fn write_all(&mut self, ctx: &IoContext, buf: &[u8]) -> Result<()> {
        if !self.open {
            return Err(WRITE.closed());
        }
        run_with_context(ctx, WRITE, self.inner.write_all(buf)).await
    }

    async fn flush(&mut self, ctx: &IoContext) -> Result<()> {
        run_with_context(ctx, WRITE, self.inner.flush()).await
    }

    async fn shutdown(&mut self, ctx: &IoContext, direction: ShutdownDirection) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if matches!(direction, ShutdownDirection::Both) {
            self.open = false;
        }
        if matches!(direction, ShutdownDirection::Read) {
            return Ok(());
        }
        // 对端已关闭时 shutdown 会报 BrokenPipe，关闭语义已达成，忽略即可。
        let _ = run_with_context(ctx, SHUTDOWN, self.inner.shutdown()).await;
        Ok(())
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<TransportSocketAddr> {
        None
    }

    fn is_ok(&self) -> bool {
        self.open
    }
}
