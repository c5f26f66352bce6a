use std::net::SocketAddr;

use async_trait::async_trait;
use spark_transport::{
    IoContext, OperationKind, Result, ShutdownDirection, TransportError, TransportSocketAddr,
    TwoWayStream, run_with_context,
};
use tokio::net::UdpSocket;

const BIND: OperationKind = OperationKind::new("spark.transport.udp.bind_failed", "udp bind");
const RECV: OperationKind = OperationKind::new("spark.transport.udp.recv_failed", "udp recv");
const SEND: OperationKind = OperationKind::new("spark.transport.udp.send_failed", "udp send");
const OVERSIZE_CODE: &str = "spark.transport.udp.oversize";

/// 单个 UDP 数据报可承载的最大负载。
pub const MAX_DATAGRAM: usize = 65_507;

/// 以数据报为单位的双向流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接无关（connectionless）的 Carrier 仍需要一个 [`TwoWayStream`]，
///   以便 Protocol 复用同一套帧读写代码；
///
/// ## 逻辑（How）
/// - `outgoing` 收集 `begin_packet` 之后的全部写入，`end_packet` 用一次 `send_to` 发出；
/// - 在包外的写入立即作为独立数据报发出；
/// - `incoming` 缓存最近收到的数据报，`read` 从中按需拷贝。
///
/// ## 契约（What）
/// - 未设置对端时写入失败（`Closed`）；
/// - 单个包超过 [`MAX_DATAGRAM`] 时 `end_packet` 返回错误，数据被丢弃；
/// - `read` 不会返回 `Ok(0)`，空数据报被跳过。
#[derive(Debug)]
pub struct DatagramChannel {
    socket: UdpSocket,
    local_addr: TransportSocketAddr,
    peer: Option<SocketAddr>,
    outgoing: Vec<u8>,
    incoming: Vec<u8>,
    incoming_pos: usize,
    in_packet: bool,
    open: bool,
}

impl DatagramChannel {
    /// 绑定本地地址，端口可为 `0`。
    pub async fn bind(addr: TransportSocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(addr))
            .await
            .map_err(|err| BIND.io_error(err))?;
        let local = socket.local_addr().map_err(|err| BIND.io_error(err))?;
        tracing::debug!(local = %local, "udp channel bound");
        Ok(Self {
            socket,
            local_addr: local.into(),
            peer: None,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            incoming_pos: 0,
            in_packet: false,
            open: true,
        })
    }

    /// 固定发送目标。
    pub fn with_peer(mut self, peer: TransportSocketAddr) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// 实际绑定的本地地址。
    pub fn local_socket_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    async fn send_datagram(&mut self, ctx: &IoContext, payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::new(
                OVERSIZE_CODE,
                format!("udp datagram of {} bytes exceeds {MAX_DATAGRAM}", payload.len()),
            ));
        }
        let Some(peer) = self.peer else {
            return Err(SEND.closed());
        };
        run_with_context(ctx, SEND, self.socket.send_to(&payload, peer)).await?;
        Ok(())
    }
}

#[async_trait]
impl TwoWayStream for DatagramChannel {
    async fn read(&mut self, ctx: &IoContext, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(RECV.closed());
        }
        while self.incoming_pos >= self.incoming.len() {
            let mut datagram = vec![0u8; MAX_DATAGRAM];
            let (len, from) =
                run_with_context(ctx, RECV, self.socket.recv_from(&mut datagram)).await?;
            if self.peer.is_none() {
                self.peer = Some(from);
            }
            datagram.truncate(len);
            self.incoming = datagram;
            self.incoming_pos = 0;
        }
        let available = &self.incoming[self.incoming_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.incoming_pos += n;
        Ok(n)
    }

    async fn write_all(&mut self, ctx: &IoContext, buf: &[u8]) -> Result<()> {
        if !self.open {
            return Err(SEND.closed());
        }
        if self.in_packet {
            self.outgoing.extend_from_slice(buf);
            Ok(())
        } else {
            self.send_datagram(ctx, buf.to_vec()).await
        }
    }

    async fn flush(&mut self, _ctx: &IoContext) -> Result<()> {
        Ok(())
    }

    fn begin_packet(&mut self) {
        self.outgoing.clear();
        self.in_packet = true;
    }

    async fn end_packet(&mut self, ctx: &IoContext) -> Result<()> {
        self.in_packet = false;
        let payload = std::mem::take(&mut self.outgoing);
        if payload.is_empty() {
            return Ok(());
        }
        self.send_datagram(ctx, payload).await
    }

    async fn shutdown(&mut self, _ctx: &IoContext, direction: ShutdownDirection) -> Result<()> {
        if matches!(direction, ShutdownDirection::Both) {
            self.open = false;
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.local_addr)
    }

    fn peer_addr(&self) -> Option<TransportSocketAddr> {
        self.peer.map(TransportSocketAddr::from)
    }

    fn is_ok(&self) -> bool {
        self.open
    }

    fn is_packetized(&self) -> bool {
        true
    }
}
