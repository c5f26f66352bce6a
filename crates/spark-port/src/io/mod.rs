//! # io：消息生产者/消费者契约
//!
//! ## 角色定位（Why）
//! - 端口核心从不解释用户负载：它只在 Carrier 帧协议的恰当时机调用 [`PortWriter::write`]
//!   与 [`PortReader::read`]；
//! - [`ConnectionWriter`] 按块累积写入，生成 [`SizedWriter`] 视图供 Carrier 先写索引再写数据；
//! - [`ConnectionReader`] 是单条已接收消息上的游标，解析失败即为协议违例。

mod reader;
mod writer;

use bytes::Bytes;

pub use reader::ConnectionReader;
pub use writer::{ConnectionWriter, MAX_BLOCKS, SizedMessage, SizedWriter};
pub(crate) use writer::check_single_line;

use crate::error::Result;

/// 消息生产者。
///
/// # 教案式注释
/// - **契约 (What)**：`write` 可能被调用多次（每个输出连接一次，各自的文本/二进制模式可能不同），
///   因此必须是纯函数式的序列化；
/// - `on_commencement` 在消息进入发送流程时调用一次，`on_completion` 在所有连接都完成
///   （或放弃）该消息后恰好调用一次。
pub trait PortWriter: Send + Sync {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()>;

    fn on_commencement(&self) {}

    fn on_completion(&self) {}
}

/// 消息消费者。
pub trait PortReader: Send {
    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()>;
}

/// 原始字节块，按原样作为一个数据块发送。
impl PortWriter for Bytes {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()> {
        writer.append_block(self.clone());
        Ok(())
    }
}

impl PortWriter for Vec<u8> {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()> {
        writer.append_raw(self);
        Ok(())
    }
}

/// 文本模式下整条字符串占一行，换行与反斜杠以转义形式发送。
impl PortWriter for String {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()> {
        if writer.is_text_mode() {
            writer.append_line(&escape_line(self));
        } else {
            writer.append_string(self);
        }
        Ok(())
    }
}

/// 读取消息剩余的全部字节。
impl PortReader for Vec<u8> {
    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()> {
        self.clear();
        self.extend_from_slice(&reader.read_rest());
        Ok(())
    }
}

impl PortReader for String {
    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()> {
        *self = if reader.is_text_mode() {
            unescape_line(&reader.expect_line()?)
        } else {
            reader.expect_string()?
        };
        Ok(())
    }
}

fn escape_line(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// 未知转义原样保留，人工键入的反斜杠不会丢失。
fn unescape_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
