use async_trait::async_trait;
use spark_transport_udp::DatagramChannel;

use super::{
    Carrier, CarrierFlags, HEADER_LEN, MAGIC_BASE, read_yarp_number, specifier_of,
    write_yarp_number, yarp_number,
};
use crate::error::{PortError, Result};
use crate::protocol::ConnectionState;

const CODE: i32 = 0;

/// 无连接 Carrier：以 TCP 完成握手后，双方迁移到 UDP 套接字，每条消息一个数据报。
///
/// 接收方在回应连接头时绑定新的 UDP 端口并以 yarp 数字告知发送方；之后双方都通过
/// `take_streams` 丢弃引导用的 TCP 流。不支持回复与确认，丢失的数据报不会重传。
#[derive(Clone, Debug, Default)]
pub struct UdpCarrier;

impl UdpCarrier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Carrier for UdpCarrier {
    fn name(&self) -> &str {
        "udp"
    }

    fn flags(&self) -> CarrierFlags {
        CarrierFlags {
            connectionless: true,
            can_escape: true,
            ..CarrierFlags::default()
        }
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        specifier_of(header).is_some_and(|specifier| specifier % 16 == CODE)
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        yarp_number(MAGIC_BASE + CODE)
    }

    async fn expect_reply_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let port = read_yarp_number(state).await?;
        let port = u16::try_from(port)
            .map_err(|_| PortError::handshake(format!("udp port {port} out of range")))?;
        let (Some(local), Some(peer)) = (state.local_addr(), state.peer_addr()) else {
            return Err(PortError::handshake("udp needs an addressed bootstrap stream"));
        };
        let channel = DatagramChannel::bind(local.with_port(0))
            .await?
            .with_peer(peer.with_port(port));
        tracing::debug!(local = %channel.local_socket_addr(), remote_port = port, "udp sender migrated");
        state.take_streams(Box::new(channel)).await
    }

    async fn respond_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let Some(local) = state.local_addr() else {
            return Err(PortError::handshake("udp needs an addressed bootstrap stream"));
        };
        let channel = DatagramChannel::bind(local.with_port(0)).await?;
        let port = channel.local_socket_addr().port();
        write_yarp_number(state, i32::from(port)).await?;
        state.flush().await?;
        tracing::debug!(local = %channel.local_socket_addr(), "udp receiver migrated");
        state.take_streams(Box::new(channel)).await
    }
}
