use bytes::{Buf, Bytes};

use crate::contact::Route;
use crate::error::{PortError, Result};

use super::ConnectionWriter;

/// 单条已接收消息上的读取游标。
///
/// # 教案式注释
/// - **意图 (Why)**：负载在协议层已完整读入，读取器只需在内存里前进游标，
///   越界即返回协议错误，不会阻塞在网络上；
/// - **契约 (What)**：若发送方期待回复，`reply_writer()` 返回可写的回复写入器，
///   处理器写入的内容由输入单元在 `end_read` 之前发回。
#[derive(Debug)]
pub struct ConnectionReader {
    data: Bytes,
    text_mode: bool,
    route: Route,
    envelope: String,
    reply: Option<ConnectionWriter>,
}

impl ConnectionReader {
    pub fn new(data: Bytes, text_mode: bool) -> Self {
        Self {
            data,
            text_mode,
            route: Route::any(),
            envelope: String::new(),
            reply: None,
        }
    }

    pub(crate) fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub(crate) fn with_envelope(mut self, envelope: String) -> Self {
        self.envelope = envelope;
        self
    }

    pub(crate) fn enable_reply(&mut self) {
        self.reply = Some(ConnectionWriter::new(self.text_mode));
    }

    pub(crate) fn take_reply(&mut self) -> Option<ConnectionWriter> {
        self.reply.take()
    }

    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    /// 消息所在连接的路由。
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// 发送方附带的信封，没有则为空串。
    pub fn envelope(&self) -> &str {
        &self.envelope
    }

    /// 发送方期待回复时可用。
    pub fn reply_writer(&mut self) -> Option<&mut ConnectionWriter> {
        self.reply.as_mut()
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn expect_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.data.remaining() < len {
            return Err(PortError::protocol(format!(
                "message truncated: wanted {len} bytes, {} left",
                self.data.remaining()
            )));
        }
        Ok(self.data.split_to(len))
    }

    pub fn expect_i32(&mut self) -> Result<i32> {
        let mut raw = self.expect_bytes(4)?;
        Ok(raw.get_i32_le())
    }

    pub fn expect_i64(&mut self) -> Result<i64> {
        let mut raw = self.expect_bytes(8)?;
        Ok(raw.get_i64_le())
    }

    pub fn expect_f64(&mut self) -> Result<f64> {
        let mut raw = self.expect_bytes(8)?;
        Ok(raw.get_f64_le())
    }

    /// 读取 `append_string` 写出的二进制字符串。
    pub fn expect_string(&mut self) -> Result<String> {
        let len = self.expect_i32()?;
        if len < 0 {
            return Err(PortError::protocol(format!("negative string length {len}")));
        }
        let raw = self.expect_bytes(len as usize)?;
        let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(&raw);
        String::from_utf8(trimmed.to_vec())
            .map_err(|_| PortError::protocol("string is not valid utf-8"))
    }

    /// 读取一行文本（去掉 `\r\n`/`\n`）；消息末尾没有换行时返回剩余内容。
    pub fn expect_line(&mut self) -> Result<String> {
        if self.data.is_empty() {
            return Err(PortError::protocol("no line left in message"));
        }
        let end = self
            .data
            .iter()
            .position(|byte| *byte == b'\n')
            .map_or(self.data.len(), |at| at + 1);
        let raw = self.data.split_to(end);
        let line = raw
            .strip_suffix(b"\n")
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .unwrap_or(&raw);
        String::from_utf8(line.to_vec()).map_err(|_| PortError::protocol("line is not valid utf-8"))
    }

    /// 取走剩余全部字节。
    pub fn read_rest(&mut self) -> Bytes {
        self.data.split_off(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reads_back_scalars_and_reports_truncation() {
        let mut writer = ConnectionWriter::new(false);
        writer.append_i32(-7);
        writer.append_f64(2.5);
        writer.append_string("port");
        let blocks = writer.into_blocks();
        let mut reader = ConnectionReader::new(blocks[0].clone(), false);
        assert_eq!(reader.expect_i32().expect("读取 i32"), -7);
        assert_eq!(reader.expect_f64().expect("读取 f64"), 2.5);
        assert_eq!(reader.expect_string().expect("读取字符串"), "port");
        assert_eq!(reader.remaining(), 0);
        assert!(reader.expect_i32().is_err());
    }

    #[test]
    fn lines_strip_terminators() {
        let mut reader = ConnectionReader::new(Bytes::from_static(b"one\r\ntwo\nthree"), true);
        assert_eq!(reader.expect_line().expect("第一行"), "one");
        assert_eq!(reader.expect_line().expect("第二行"), "two");
        assert_eq!(reader.expect_line().expect("无换行的末行"), "three");
        assert!(reader.expect_line().is_err());
    }
}
