//! 二进制 Carrier 共用的线上格式。
//!
//! “yarp 数字”为 8 字节 `'Y' 'A' <i32 LE> 'R' 'P'`；连接头、消息索引与确认都以它开头。

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PortError, Result};
use crate::io::SizedWriter;
use crate::protocol::ConnectionState;

pub const HEADER_LEN: usize = 8;

/// 连接头中的数字为 `MAGIC_BASE + specifier`。
pub const MAGIC_BASE: i32 = 7777;

const INDEX_MARK: i32 = 10;
const INDEX_HEADER_LEN: usize = 10;
const MAX_NAME: usize = 4096;
const MAX_MESSAGE: usize = 128 * 1024 * 1024;
const MAX_ACK_PAYLOAD: usize = 64 * 1024;

pub fn yarp_number(value: i32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..2].copy_from_slice(b"YA");
    out[2..6].copy_from_slice(&value.to_le_bytes());
    out[6..].copy_from_slice(b"RP");
    out
}

pub fn parse_yarp_number(header: &[u8; HEADER_LEN]) -> Option<i32> {
    if &header[..2] != b"YA" || &header[6..] != b"RP" {
        return None;
    }
    Some(i32::from_le_bytes([header[2], header[3], header[4], header[5]]))
}

/// 连接头中的 specifier；不是连接头时返回 `None`。
pub fn specifier_of(header: &[u8; HEADER_LEN]) -> Option<i32> {
    parse_yarp_number(header)
        .map(|number| number - MAGIC_BASE)
        .filter(|specifier| *specifier >= 0)
}

pub async fn write_yarp_number(state: &mut ConnectionState, value: i32) -> Result<()> {
    state.write_all(&yarp_number(value)).await
}

pub async fn read_yarp_number(state: &mut ConnectionState) -> Result<i32> {
    let raw = read_header(state).await?;
    parse_yarp_number(&raw)
        .ok_or_else(|| PortError::protocol(format!("expected a yarp number, got {raw:02x?}")))
}

pub(crate) async fn read_header(state: &mut ConnectionState) -> Result<[u8; HEADER_LEN]> {
    let raw = state.read_exact(HEADER_LEN).await?;
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&raw);
    Ok(header)
}

/// `u32 LE` 长度（含 NUL）+ 名字 + NUL。
pub(crate) async fn send_sender_specifier(state: &mut ConnectionState, name: &str) -> Result<()> {
    let mut out = BytesMut::with_capacity(name.len() + 5);
    out.put_u32_le(name.len() as u32 + 1);
    out.extend_from_slice(name.as_bytes());
    out.put_u8(0);
    state.write_all(&out).await
}

pub(crate) async fn expect_sender_specifier(state: &mut ConnectionState) -> Result<String> {
    let raw = state.read_exact(4).await?;
    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if len == 0 || len > MAX_NAME {
        return Err(PortError::handshake(format!("sender name length {len} out of range")));
    }
    let name = state.read_exact(len).await?;
    let trimmed = name.strip_suffix(&[0u8]).unwrap_or(&name);
    String::from_utf8(trimmed.to_vec())
        .map_err(|_| PortError::handshake("sender name is not valid utf-8"))
}

/// 索引：`yarp(10)`，`[块数, 回复块数, 0xff × 8]`，各块长度，回复块长度，随后是数据块。
pub(crate) async fn send_index(state: &mut ConnectionState, message: &dyn SizedWriter) -> Result<()> {
    let blocks = message.length();
    let mut out = BytesMut::with_capacity(HEADER_LEN + INDEX_HEADER_LEN + 4 * (blocks + 1));
    out.extend_from_slice(&yarp_number(INDEX_MARK));
    out.put_u8(blocks as u8);
    out.put_u8(1);
    out.put_bytes(0xff, INDEX_HEADER_LEN - 2);
    for index in 0..blocks {
        out.put_u32_le(message.length_of(index) as u32);
    }
    out.put_u32_le(0);
    state.write_all(&out).await?;
    for index in 0..blocks {
        state.write_all(message.block(index)).await?;
    }
    Ok(())
}

pub(crate) async fn expect_index(state: &mut ConnectionState) -> Result<Bytes> {
    let mark = read_yarp_number(state).await?;
    if mark != INDEX_MARK {
        return Err(PortError::protocol(format!("expected message index, got {mark}")));
    }
    let index = state.read_exact(INDEX_HEADER_LEN).await?;
    let blocks = usize::from(index[0]);
    let replies = usize::from(index[1]);
    let lengths = state.read_exact(4 * (blocks + replies)).await?;
    let mut total = 0usize;
    for raw in lengths.chunks_exact(4).take(blocks) {
        total += u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    }
    if total > MAX_MESSAGE {
        return Err(PortError::protocol(format!("message of {total} bytes is too large")));
    }
    state.read_exact(total).await
}

/// 确认为 `yarp(n)`，随后的 `n` 字节被丢弃。
pub(crate) async fn expect_ack(state: &mut ConnectionState) -> Result<()> {
    let len = read_yarp_number(state).await?;
    if len < 0 || len as usize > MAX_ACK_PAYLOAD {
        return Err(PortError::protocol(format!("bad acknowledgement length {len}")));
    }
    if len > 0 {
        state.read_exact(len as usize).await?;
    }
    Ok(())
}
