//! # face：监听与拨号
//!
//! ## 角色定位（Why）
//! - 端口核心只关心“接受一条流”和“拨出一条流”，具体用哪种套接字由 [`Face`] 决定；
//! - 面向连接的 Carrier 都从 TCP 引导，UDP Carrier 在握手后自行换流。
//!
//! ## 契约（What）
//! - `accept` 在 `close()` 之后立即以中断错误返回；
//! - `connect` 继承调用方 [`IoContext`] 的超时与中断。

use async_trait::async_trait;
use spark_transport::{InterruptHandle, IoContext, TransportSocketAddr, TwoWayStream};
use spark_transport_tcp::{TcpChannel, TcpListener};

use crate::contact::{Contact, resolve_host};
use crate::error::{PortError, Result};

/// 端口的网络入口。
#[async_trait]
pub trait Face: Send + Sync {
    /// 等待下一条入站流。
    async fn accept(&self) -> Result<Box<dyn TwoWayStream>>;

    /// 拨向 `contact`。
    async fn connect(&self, contact: &Contact, ctx: &IoContext) -> Result<Box<dyn TwoWayStream>>;

    /// 监听地址（名称为空）。
    fn local_contact(&self) -> Contact;

    /// 停止监听；正在等待的 `accept` 立即返回。
    fn close(&self);
}

/// 基于 TCP 的 Face。
#[derive(Debug)]
pub struct TcpFace {
    listener: TcpListener,
    ctx: IoContext,
    contact: Contact,
}

impl TcpFace {
    /// 在 `host:port` 上监听；`port = 0` 时由系统分配。
    pub async fn listen(host: &str, port: u16) -> Result<Self> {
        let ip = resolve_host(host).ok_or_else(|| PortError::Config {
            detail: format!("`{host}` is not an IP address"),
        })?;
        let listener = TcpListener::bind(TransportSocketAddr::from(std::net::SocketAddr::new(
            ip, port,
        )))
        .await?;
        let local = listener.local_addr();
        let contact = Contact::new("", host, local.port()).with_carrier("tcp");
        Ok(Self {
            listener,
            ctx: IoContext::new().with_interrupt(InterruptHandle::new()),
            contact,
        })
    }
}

#[async_trait]
impl Face for TcpFace {
    async fn accept(&self) -> Result<Box<dyn TwoWayStream>> {
        let (channel, remote) = self.listener.accept(&self.ctx).await?;
        tracing::trace!(remote = %remote, "accepted tcp stream");
        Ok(Box::new(channel))
    }

    async fn connect(&self, contact: &Contact, ctx: &IoContext) -> Result<Box<dyn TwoWayStream>> {
        tcp_connect(contact, ctx).await
    }

    fn local_contact(&self) -> Contact {
        self.contact.clone()
    }

    fn close(&self) {
        self.ctx.interrupt_handle().interrupt();
    }
}

/// 向 `contact` 建立 TCP 流；失败映射为 [`PortError::ConnectionRefused`]。
pub async fn tcp_connect(contact: &Contact, ctx: &IoContext) -> Result<Box<dyn TwoWayStream>> {
    let addr = contact.socket_addr()?;
    let channel = TcpChannel::connect(ctx, addr)
        .await
        .map_err(|err| PortError::ConnectionRefused {
            target: contact.to_string(),
            detail: err.to_string(),
        })?;
    Ok(Box::new(channel))
}
