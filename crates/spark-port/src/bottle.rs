//! # bottle：最小化的值列表编解码
//!
//! ## 角色定位（Why）
//! - 管理命令（`help`、`list`、`prop` 等）与它们的回复需要一种双方都认识的结构化格式；
//! - 用户数据的编码与端口核心无关，`Bottle` 只是 [`PortWriter`]/[`PortReader`] 的一个实现。
//!
//! ## 编码（What）
//! - 二进制：列表标签 `256` + `i32` 元素个数，随后每个元素为 `i32` 标签 + 值；
//!   标签 `1` 为 `i32`，`9` 为词汇，`10` 为 `f64`，`17` 为 `i64`，`4` 为字符串，`256` 为嵌套列表；
//!   列表标签低位非零时表示“同构列表”，元素不再单独带标签；
//! - 文本：空格分隔，必要时字符串加引号，词汇写作 `[word]`，嵌套列表写在括号内。

use std::fmt;

use crate::error::{PortError, Result};
use crate::io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter};

const TAG_INT: i32 = 1;
const TAG_VOCAB: i32 = 1 + 8;
const TAG_FLOAT: i32 = 2 + 8;
const TAG_INT64: i32 = 1 + 16;
const TAG_STRING: i32 = 4;
const TAG_LIST: i32 = 256;

/// 嵌套深度上限，防止恶意输入耗尽栈。
const MAX_DEPTH: usize = 32;

/// 把至多 4 个 ASCII 字符打包为词汇编码（小端）。
pub fn vocab(word: &str) -> u32 {
    word.bytes()
        .take(4)
        .enumerate()
        .fold(0, |acc, (index, byte)| acc | (u32::from(byte) << (8 * index)))
}

/// [`vocab`] 的逆运算。
pub fn vocab_to_string(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| char::from(*byte))
        .collect()
}

/// 单个元素。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Int64(i64),
    Float(f64),
    Str(String),
    Vocab(u32),
    List(Bottle),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Int64(value) => i32::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(i64::from(*value)),
            Value::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(f64::from(*value)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_vocab(&self) -> Option<u32> {
        match self {
            Value::Vocab(code) => Some(*code),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Bottle> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// 字符串或词汇的文本形式；管理命令的关键字两种写法都接受。
    pub fn as_word(&self) -> Option<String> {
        match self {
            Value::Str(text) => Some(text.clone()),
            Value::Vocab(code) => Some(vocab_to_string(*code)),
            _ => None,
        }
    }

    fn tag(&self) -> i32 {
        match self {
            Value::Int(_) => TAG_INT,
            Value::Int64(_) => TAG_INT64,
            Value::Float(_) => TAG_FLOAT,
            Value::Str(_) => TAG_STRING,
            Value::Vocab(_) => TAG_VOCAB,
            Value::List(_) => TAG_LIST,
        }
    }

    fn write_body(&self, writer: &mut ConnectionWriter) {
        match self {
            Value::Int(value) => writer.append_i32(*value),
            Value::Int64(value) => writer.append_i64(*value),
            Value::Float(value) => writer.append_f64(*value),
            Value::Str(text) => writer.append_string(text),
            Value::Vocab(code) => writer.append_i32(*code as i32),
            Value::List(list) => list.write_items(writer),
        }
    }

    fn read_body(tag: i32, reader: &mut ConnectionReader, depth: usize) -> Result<Self> {
        Ok(match tag {
            TAG_INT => Value::Int(reader.expect_i32()?),
            TAG_INT64 => Value::Int64(reader.expect_i64()?),
            TAG_FLOAT => Value::Float(reader.expect_f64()?),
            TAG_STRING => Value::Str(reader.expect_string()?),
            TAG_VOCAB => Value::Vocab(reader.expect_i32()? as u32),
            tag if tag & TAG_LIST != 0 => Value::List(Bottle::read_items(tag, reader, depth + 1)?),
            other => return Err(PortError::protocol(format!("unknown bottle tag {other}"))),
        })
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Bottle> for Value {
    fn from(value: Bottle) -> Self {
        Value::List(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Int64(value) => write!(f, "{value}"),
            Value::Float(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{value:.1}")
            }
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(text) if needs_quotes(text) => {
                f.write_str("\"")?;
                for ch in text.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Value::Str(text) => f.write_str(text),
            Value::Vocab(code) => write!(f, "[{}]", vocab_to_string(*code)),
            Value::List(list) => write!(f, "({list})"),
        }
    }
}

fn needs_quotes(text: &str) -> bool {
    text.is_empty()
        || text.parse::<f64>().is_ok()
        || text
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\\' | '(' | ')' | '[' | ']'))
}

/// 有序值列表。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bottle {
    items: Vec<Value>,
}

impl Bottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// 解析文本形式。
    pub fn from_text(text: &str) -> Result<Self> {
        let mut parser = TextParser {
            chars: text.chars().peekable(),
        };
        parser.list(None, 0)
    }

    pub fn push(&mut self, value: impl Into<Value>) -> &mut Self {
        self.items.push(value.into());
        self
    }

    pub fn add_vocab(&mut self, word: &str) -> &mut Self {
        self.items.push(Value::Vocab(vocab(word)));
        self
    }

    /// 追加 `(key value)` 形式的子列表。
    pub fn add_pair(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.items
            .push(Value::List(Bottle::from_values([Value::from(key), value.into()])));
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 在 `(key value)` 形式的子列表中查找 `key` 对应的值。
    pub fn find(&self, key: &str) -> Option<&Value> {
        self.items.iter().find_map(|item| {
            let list = item.as_list()?;
            (list.get(0)?.as_word()? == key).then(|| list.get(1)).flatten()
        })
    }

    fn write_items(&self, writer: &mut ConnectionWriter) {
        writer.append_i32(self.items.len() as i32);
        for item in &self.items {
            writer.append_i32(item.tag());
            item.write_body(writer);
        }
    }

    fn read_items(tag: i32, reader: &mut ConnectionReader, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(PortError::protocol("bottle nesting too deep"));
        }
        let count = reader.expect_i32()?;
        if count < 0 || count as usize > reader.remaining() {
            return Err(PortError::protocol(format!("implausible bottle length {count}")));
        }
        let subtype = tag & !TAG_LIST;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let item_tag = if subtype != 0 { subtype } else { reader.expect_i32()? };
            items.push(Value::read_body(item_tag, reader, depth)?);
        }
        Ok(Self { items })
    }
}

impl fmt::Display for Bottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, item) in self.items.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl PortWriter for Bottle {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()> {
        if writer.is_text_mode() {
            writer.append_line(&self.to_string());
        } else {
            writer.append_i32(TAG_LIST);
            self.write_items(writer);
        }
        Ok(())
    }
}

impl PortReader for Bottle {
    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()> {
        *self = if reader.is_text_mode() {
            Bottle::from_text(&reader.expect_line()?)?
        } else {
            let tag = reader.expect_i32()?;
            if tag & TAG_LIST == 0 {
                return Err(PortError::protocol(format!("expected a bottle, found tag {tag}")));
            }
            Bottle::read_items(tag, reader, 0)?
        };
        Ok(())
    }
}

struct TextParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl TextParser<'_> {
    fn list(&mut self, close: Option<char>, depth: usize) -> Result<Bottle> {
        if depth > MAX_DEPTH {
            return Err(PortError::protocol("bottle nesting too deep"));
        }
        let mut bottle = Bottle::new();
        loop {
            while self.chars.next_if(|ch| ch.is_whitespace()).is_some() {}
            match self.chars.peek().copied() {
                None if close.is_none() => return Ok(bottle),
                None => return Err(PortError::protocol("unterminated list")),
                Some(ch) if Some(ch) == close => {
                    self.chars.next();
                    return Ok(bottle);
                }
                Some(')') => return Err(PortError::protocol("unbalanced ')'")),
                Some('(') => {
                    self.chars.next();
                    bottle.items.push(Value::List(self.list(Some(')'), depth + 1)?));
                }
                Some('[') => {
                    self.chars.next();
                    let word = self.take_until(|ch| ch == ']');
                    if self.chars.next() != Some(']') {
                        return Err(PortError::protocol("unterminated vocab"));
                    }
                    bottle.items.push(Value::Vocab(vocab(&word)));
                }
                Some('"') => {
                    self.chars.next();
                    bottle.items.push(Value::Str(self.quoted()?));
                }
                Some(_) => {
                    let token = self
                        .take_until(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '[' | '"'));
                    bottle.items.push(classify(token));
                }
            }
        }
    }

    fn take_until(&mut self, stop: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(ch) = self.chars.next_if(|ch| !stop(*ch)) {
            out.push(ch);
        }
        out
    }

    fn quoted(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(PortError::protocol("unterminated string")),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => return Err(PortError::protocol("unterminated string")),
                },
                Some(other) => out.push(other),
            }
        }
    }
}

fn classify(token: String) -> Value {
    if let Ok(value) = token.parse::<i32>() {
        return Value::Int(value);
    }
    if let Ok(value) = token.parse::<i64>() {
        return Value::Int64(value);
    }
    if token.contains(['.', 'e', 'E'])
        && let Ok(value) = token.parse::<f64>()
    {
        return Value::Float(value);
    }
    Value::Str(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(bottle: &Bottle) -> Bottle {
        let mut writer = ConnectionWriter::new(false);
        bottle.write(&mut writer).expect("编码");
        let bytes = crate::io::SizedMessage::payload(writer).to_bytes();
        let mut reader = ConnectionReader::new(bytes, false);
        let mut decoded = Bottle::new();
        decoded.read(&mut reader).expect("解码");
        decoded
    }

    #[test]
    fn ints_survive_binary_encoding() {
        let mut bottle = Bottle::new();
        bottle.push(1_i32).push(2_i32).push(3_i32);
        let decoded = binary(&bottle);
        assert_eq!(decoded.get(0).and_then(Value::as_int), Some(1));
        assert_eq!(decoded.get(1).and_then(Value::as_int), Some(2));
        assert_eq!(decoded.get(2).and_then(Value::as_int), Some(3));
    }

    #[test]
    fn nested_values_survive_binary_encoding() {
        let mut bottle = Bottle::new();
        bottle.add_vocab("list").push("out").push(2.5).push(1_i64 << 40);
        bottle.add_pair("from", "/w");
        assert_eq!(binary(&bottle), bottle);
    }

    #[test]
    fn text_form_is_readable() {
        let mut bottle = Bottle::new();
        bottle.add_vocab("ver").push(1_i32).push(2.0).push("two words").push("plain");
        bottle.add_pair("carrier", "tcp");
        let text = bottle.to_string();
        assert_eq!(text, "[ver] 1 2.0 \"two words\" plain (carrier tcp)");
        assert_eq!(Bottle::from_text(&text).expect("文本可解析"), bottle);
    }

    #[test]
    fn homogeneous_int_list_is_accepted() {
        let mut writer = ConnectionWriter::new(false);
        writer.append_i32(TAG_LIST | TAG_INT);
        writer.append_i32(2);
        writer.append_i32(7);
        writer.append_i32(8);
        let bytes = crate::io::SizedMessage::payload(writer).to_bytes();
        let mut decoded = Bottle::new();
        decoded
            .read(&mut ConnectionReader::new(bytes, false))
            .expect("同构列表");
        assert_eq!(decoded.to_string(), "7 8");
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        assert!(Bottle::from_text("(1 2").is_err());
        assert!(Bottle::from_text("\"open").is_err());
        let mut reader = ConnectionReader::new(bytes::Bytes::from_static(&[0, 1, 0, 0, 9]), false);
        let err = Bottle::new().read(&mut reader).expect_err("截断的输入");
        assert_eq!(err.code(), "spark.port.protocol.violation");
    }

    #[test]
    fn find_looks_up_key_value_pairs() {
        let bottle = Bottle::from_text("(from /w) (to /r)").expect("文本可解析");
        assert_eq!(bottle.find("to").and_then(Value::as_str), Some("/r"));
        assert!(bottle.find("carrier").is_none());
        assert_eq!(vocab_to_string(vocab("help")), "help");
    }
}
