use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use super::{Carrier, CarrierFlags, HEADER_LEN};
use crate::command::key;
use crate::error::{PortError, Result};
use crate::io::{SizedWriter, check_single_line};
use crate::protocol::ConnectionState;

const PLAIN_HEADER: &[u8; HEADER_LEN] = b"CONNECT ";
const ACK_HEADER: &[u8; HEADER_LEN] = b"CONNACK ";
const ACK_LINE: &str = "<ACK>";

/// 面向人类的行协议，可直接用 telnet 连接端口。
///
/// # 教案式注释
/// - **逻辑 (How)**：连接头后跟发送方名字一行，接收方回 `Welcome <name>`；
///   每条消息是一行端口命令，`d`/`D`/`a` 命令后再跟一行负载；
/// - **契约 (What)**：`text` 不支持回复与确认；`text_ack` 在每条消息后回 `<ACK>` 行，
///   回复恰好是一行文本。
#[derive(Clone, Debug)]
pub struct TextCarrier {
    ack: bool,
}

impl TextCarrier {
    pub fn new(ack: bool) -> Self {
        Self { ack }
    }

    fn own_header(&self) -> &'static [u8; HEADER_LEN] {
        if self.ack { ACK_HEADER } else { PLAIN_HEADER }
    }
}

/// 拼接为行文本：命令行在前，`d`/`D`/`a` 之后恰好跟一行负载（可为空行）。
///
/// 负载多于一行时拒绝写出，否则接收方会把多出的行当作下一条命令。
fn joined_lines(message: &dyn SizedWriter) -> Result<Bytes> {
    let payload = message.header_length()..message.length();
    check_single_line(payload.clone().map(|index| message.block(index)))?;

    let mut out = BytesMut::with_capacity(message.total_len() + 2);
    for index in 0..message.header_length() {
        out.extend_from_slice(message.block(index));
    }
    if !out.is_empty() && out.last() != Some(&b'\n') {
        out.put_u8(b'\n');
    }
    let carries_payload = message.header_length() == 0
        || matches!(
            out.first().map(|byte| char::from(*byte)),
            Some(key::DATA | key::DATA_NO_REPLY | key::ADMIN)
        );
    if carries_payload {
        let start = out.len();
        for index in payload {
            out.extend_from_slice(message.block(index));
        }
        if out.len() == start || out.last() != Some(&b'\n') {
            out.put_u8(b'\n');
        }
    }
    Ok(out.freeze())
}

#[async_trait]
impl Carrier for TextCarrier {
    fn name(&self) -> &str {
        if self.ack { "text_ack" } else { "text" }
    }

    fn flags(&self) -> CarrierFlags {
        CarrierFlags {
            can_escape: true,
            supports_reply: self.ack,
            requires_ack: self.ack,
            text_mode: true,
            ..CarrierFlags::default()
        }
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        header == self.own_header()
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        *self.own_header()
    }

    async fn send_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let line = format!("{}\r\n", state.route().from());
        state.write_all(self.own_header()).await?;
        state.write_all(line.as_bytes()).await
    }

    async fn expect_reply_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let line = state.read_line().await?;
        if !line.starts_with("Welcome") {
            return Err(PortError::handshake(format!("unexpected greeting `{line}`")));
        }
        Ok(())
    }

    async fn expect_sender_specifier(&mut self, state: &mut ConnectionState) -> Result<()> {
        let from = state.read_line().await?.trim().to_owned();
        let route = state.route().clone().with_from(from);
        state.set_route(route);
        Ok(())
    }

    async fn respond_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let line = format!("Welcome {}\r\n", state.route().from());
        state.write_all(line.as_bytes()).await
    }

    async fn write(&mut self, state: &mut ConnectionState, message: &dyn SizedWriter) -> Result<()> {
        state.write_all(&joined_lines(message)?).await
    }

    async fn expect_index(&mut self, state: &mut ConnectionState) -> Result<Bytes> {
        let command = loop {
            let line = state.read_line().await?;
            if !line.trim().is_empty() {
                break line;
            }
        };
        let mut out = BytesMut::with_capacity(command.len() + 1);
        out.extend_from_slice(command.as_bytes());
        out.put_u8(b'\n');
        if matches!(
            command.chars().next(),
            Some(key::DATA | key::DATA_NO_REPLY | key::ADMIN)
        ) {
            let payload = state.read_line().await?;
            out.extend_from_slice(payload.as_bytes());
            out.put_u8(b'\n');
        }
        Ok(out.freeze())
    }

    async fn reply(&mut self, state: &mut ConnectionState, message: &dyn SizedWriter) -> Result<()> {
        state.write_all(&joined_lines(message)?).await
    }

    async fn expect_reply(&mut self, state: &mut ConnectionState) -> Result<Bytes> {
        let mut line = state.read_line().await?.into_bytes();
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    async fn send_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        state.write_all(format!("{ACK_LINE}\r\n").as_bytes()).await
    }

    async fn expect_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        let line = state.read_line().await?;
        if line.trim() != ACK_LINE {
            return Err(PortError::protocol(format!("expected {ACK_LINE}, got `{line}`")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PortCommand;
    use crate::io::{ConnectionWriter, SizedMessage};

    fn message(command: PortCommand, payload: &[u8]) -> SizedMessage {
        let mut head = ConnectionWriter::new(true);
        command.write(&mut head);
        let mut body = ConnectionWriter::new(true);
        body.append_raw(payload);
        SizedMessage::assemble(Some(head), body, false)
    }

    #[test]
    fn data_always_carries_exactly_one_payload_line() {
        let empty = joined_lines(&message(PortCommand::data("", false), b"")).expect("空负载");
        assert_eq!(&empty[..], b"D\n\n");
        let quit = joined_lines(&message(PortCommand::quit(), b"")).expect("退出");
        assert_eq!(&quit[..], b"q\n");
        let split = joined_lines(&message(PortCommand::data("", false), b"a\nb"));
        assert!(matches!(split, Err(PortError::Protocol { .. })));
    }
}
