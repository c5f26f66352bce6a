use spark_transport::{IoContext, Result, TransportSocketAddr, run_with_context};
use tokio::net::TcpListener as TokioTcpListener;

use crate::{TcpChannel, error};

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端口的 Face 需要“监听 → 接受连接”的最小能力；`accept` 继承 [`IoContext`] 的中断语义，
///   端口关闭时监听任务可以被立即唤醒退出。
///
/// ## 契约 (What)
/// - `bind` 支持端口 `0`，实际端口通过 `local_addr` 查询；
/// - `accept` 成功返回已拆分读写半部的 [`TcpChannel`] 与对端地址。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: TransportSocketAddr,
}

impl TcpListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(addr: TransportSocketAddr) -> Result<Self> {
        let listener = TokioTcpListener::bind(std::net::SocketAddr::from(addr))
            .await
            .map_err(|err| error::BIND.io_error(err))?;
        let local = listener
            .local_addr()
            .map_err(|err| error::BIND.io_error(err))?;
        tracing::debug!(local = %local, "tcp listener bound");
        Ok(Self {
            inner: listener,
            local_addr: local.into(),
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    /// 接受一个入站连接。
    pub async fn accept(&self, ctx: &IoContext) -> Result<(TcpChannel, TransportSocketAddr)> {
        let (stream, remote) = run_with_context(ctx, error::ACCEPT, self.inner.accept()).await?;
        let channel = TcpChannel::from_stream(stream)?;
        Ok((channel, remote.into()))
    }
}
