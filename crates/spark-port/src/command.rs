//! 每条消息前的端口命令。
//!
//! 二进制形式为 8 字节 `[env_len u32 LE, '~', key, 0, 1]`，随后是 `env_len` 字节的参数；
//! 文本形式为一行 `"<key>[ <参数>]"`，其中添加输出直接写目标端口名（`/r`），
//! 删除命令写作 `!/r`、`~/w`。

use crate::error::{PortError, Result};
use crate::io::{ConnectionReader, ConnectionWriter};

/// 命令键。
pub mod key {
    pub const DATA: char = 'd';
    pub const DATA_NO_REPLY: char = 'D';
    pub const ADMIN: char = 'a';
    pub const QUIT: char = 'q';
    pub const REVERSE: char = 'r';
    pub const ADD_OUTPUT: char = '/';
    pub const REMOVE_OUTPUT: char = '!';
    pub const REMOVE_INPUT: char = '~';
    pub const DESCRIBE: char = '*';
    pub const HELP: char = '?';
    pub const HELP_ALT: char = 'h';
}

const ESCAPE: u8 = b'~';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCommand {
    key: char,
    text: String,
}

impl PortCommand {
    pub fn new(key: char, text: impl Into<String>) -> Self {
        Self {
            key,
            text: text.into(),
        }
    }

    /// 数据消息；`envelope` 随消息传给接收方。
    pub fn data(envelope: &str, want_reply: bool) -> Self {
        let key = if want_reply {
            key::DATA
        } else {
            key::DATA_NO_REPLY
        };
        Self::new(key, envelope)
    }

    pub fn admin() -> Self {
        Self::new(key::ADMIN, "")
    }

    pub fn quit() -> Self {
        Self::new(key::QUIT, "")
    }

    pub fn reverse() -> Self {
        Self::new(key::REVERSE, "")
    }

    pub fn key(&self) -> char {
        self.key
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 命令后面是否跟着负载。
    pub fn expects_payload(&self) -> bool {
        matches!(self.key, key::DATA | key::DATA_NO_REPLY | key::ADMIN)
    }

    /// 发送方是否等待回复。
    pub fn wants_reply(&self) -> bool {
        matches!(self.key, key::DATA | key::ADMIN)
    }

    pub fn write(&self, writer: &mut ConnectionWriter) {
        if writer.is_text_mode() {
            writer.append_line(&self.text_line());
        } else {
            let mut header = [0u8; 8];
            header[..4].copy_from_slice(&(self.text.len() as u32).to_le_bytes());
            header[4] = ESCAPE;
            header[5] = self.key as u8;
            header[7] = 1;
            writer.append_raw(&header);
            writer.append_raw(self.text.as_bytes());
        }
    }

    fn text_line(&self) -> String {
        match self.key {
            key::ADD_OUTPUT => format!("/{}", self.text.trim_start_matches('/')),
            key::REMOVE_OUTPUT | key::REMOVE_INPUT => format!("{}{}", self.key, self.text),
            _ if self.text.is_empty() => self.key.to_string(),
            _ => format!("{} {}", self.key, self.text),
        }
    }

    pub fn read(reader: &mut ConnectionReader) -> Result<Self> {
        if reader.is_text_mode() {
            Self::parse_line(&reader.expect_line()?)
        } else {
            let header = reader.expect_bytes(8)?;
            if header[4] != ESCAPE {
                return Err(PortError::protocol(format!(
                    "bad port command header {:02x?}",
                    &header[..]
                )));
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let raw = reader.expect_bytes(len)?;
            let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(&raw);
            let text = String::from_utf8(trimmed.to_vec())
                .map_err(|_| PortError::protocol("port command text is not valid utf-8"))?;
            Ok(Self::new(char::from(header[5]), text))
        }
    }

    /// 解析文本命令行。
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let mut chars = line.chars();
        let Some(key) = chars.next() else {
            return Err(PortError::protocol("empty port command"));
        };
        let rest = chars.as_str();
        let text = match key {
            key::ADD_OUTPUT => line.to_owned(),
            key::REMOVE_OUTPUT | key::REMOVE_INPUT => rest.trim().to_owned(),
            _ => rest.trim_start().to_owned(),
        };
        Ok(Self::new(key, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SizedMessage;

    fn decode(command: &PortCommand, text_mode: bool) -> PortCommand {
        let mut writer = ConnectionWriter::new(text_mode);
        command.write(&mut writer);
        let bytes = SizedMessage::payload(writer).to_bytes();
        PortCommand::read(&mut ConnectionReader::new(bytes, text_mode)).expect("命令可解析")
    }

    #[test]
    fn binary_header_layout() {
        let mut writer = ConnectionWriter::new(false);
        PortCommand::data("env", true).write(&mut writer);
        let bytes = SizedMessage::payload(writer).to_bytes();
        assert_eq!(&bytes[..], &[3, 0, 0, 0, b'~', b'd', 0, 1, b'e', b'n', b'v']);
    }

    #[test]
    fn commands_decode_in_both_modes() {
        for text_mode in [false, true] {
            for command in [
                PortCommand::data("", false),
                PortCommand::data("stamp 7", true),
                PortCommand::admin(),
                PortCommand::new(key::ADD_OUTPUT, "/r"),
                PortCommand::new(key::REMOVE_OUTPUT, "/r"),
                PortCommand::new(key::REMOVE_INPUT, "/w"),
            ] {
                let decoded = decode(&command, text_mode);
                assert_eq!(decoded.key(), command.key());
                assert_eq!(decoded.text(), command.text(), "text_mode={text_mode}");
            }
        }
    }

    #[test]
    fn typed_lines_follow_human_conventions() {
        let add = PortCommand::parse_line("/r\r").expect("添加输出");
        assert_eq!((add.key(), add.text()), ('/', "/r"));
        let remove = PortCommand::parse_line("!/r").expect("删除输出");
        assert_eq!((remove.key(), remove.text()), ('!', "/r"));
        let data = PortCommand::parse_line("d").expect("数据");
        assert!(data.expects_payload() && data.wants_reply());
        assert!(!PortCommand::parse_line("D").expect("数据").wants_reply());
        assert!(PortCommand::parse_line("").is_err());
    }
}
