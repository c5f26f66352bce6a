use async_trait::async_trait;

use super::{
    Carrier, CarrierFlags, HEADER_LEN, MAGIC_BASE, read_yarp_number, specifier_of,
    write_yarp_number, yarp_number,
};
use crate::error::{PortError, Result};
use crate::protocol::ConnectionState;

const CODE: i32 = 3;
const ACK_FLAG: i32 = 128;

/// 默认的可靠流 Carrier。
///
/// `tcp` 在每条消息后等待确认；别名 `fast_tcp` 省去确认，吞吐更高但写入方无法得知对端是否已收到。
/// 接收方以一个携带本地端口号的 yarp 数字回应连接头。
#[derive(Clone, Debug)]
pub struct TcpCarrier {
    ack: bool,
}

impl TcpCarrier {
    pub fn new(ack: bool) -> Self {
        Self { ack }
    }
}

#[async_trait]
impl Carrier for TcpCarrier {
    fn name(&self) -> &str {
        if self.ack { "tcp" } else { "fast_tcp" }
    }

    fn flags(&self) -> CarrierFlags {
        CarrierFlags {
            can_escape: true,
            supports_reply: true,
            requires_ack: self.ack,
            ..CarrierFlags::default()
        }
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn create_named(&self, name: &str) -> Option<Box<dyn Carrier>> {
        match name {
            "tcp" => Some(Box::new(TcpCarrier::new(true))),
            "fast_tcp" => Some(Box::new(TcpCarrier::new(false))),
            _ => None,
        }
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        specifier_of(header).is_some_and(|specifier| specifier % 16 == CODE)
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let specifier = if self.ack { CODE | ACK_FLAG } else { CODE };
        yarp_number(MAGIC_BASE + specifier)
    }

    fn set_parameters(&mut self, header: &[u8; HEADER_LEN]) {
        self.ack = specifier_of(header).is_some_and(|specifier| specifier & ACK_FLAG != 0);
    }

    async fn expect_reply_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let port = read_yarp_number(state)
            .await
            .map_err(|err| PortError::handshake(format!("no reply to header: {err}")))?;
        tracing::trace!(remote_port = port, "tcp header acknowledged");
        Ok(())
    }

    async fn respond_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let port = state.local_addr().map_or(0, |addr| i32::from(addr.port()));
        write_yarp_number(state, port).await
    }
}
