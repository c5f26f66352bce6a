use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PortError, Result};

/// 二进制索引头用一个字节表示块数，单条消息最多 255 个块。
pub const MAX_BLOCKS: usize = 255;

/// 按块累积的消息写入器。
///
/// 小的标量写入合并进当前块；`append_block` 直接挂接外部 `Bytes`，不拷贝。
#[derive(Clone, Debug, Default)]
pub struct ConnectionWriter {
    blocks: Vec<Bytes>,
    pending: BytesMut,
    text_mode: bool,
}

impl ConnectionWriter {
    pub fn new(text_mode: bool) -> Self {
        Self {
            text_mode,
            ..Self::default()
        }
    }

    /// 目标 Carrier 是否为文本协议。
    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    pub fn append_i32(&mut self, value: i32) {
        self.pending.put_i32_le(value);
    }

    pub fn append_i64(&mut self, value: i64) {
        self.pending.put_i64_le(value);
    }

    pub fn append_f64(&mut self, value: f64) {
        self.pending.put_f64_le(value);
    }

    /// 追加原始字节到当前块。
    pub fn append_raw(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// 以独立块挂接外部数据。
    pub fn append_block(&mut self, block: Bytes) {
        self.seal();
        self.blocks.push(block);
    }

    /// 二进制字符串：`i32` 长度（含结尾 NUL）+ 字节 + NUL。
    pub fn append_string(&mut self, text: &str) {
        self.append_i32(text.len() as i32 + 1);
        self.pending.extend_from_slice(text.as_bytes());
        self.pending.put_u8(0);
    }

    /// 追加文本（不加换行）。
    pub fn append_text(&mut self, text: &str) {
        self.pending.extend_from_slice(text.as_bytes());
    }

    /// 追加一行文本，自动补 `\n`。
    pub fn append_line(&mut self, text: &str) {
        self.append_text(text);
        self.pending.put_u8(b'\n');
    }

    /// 文本模式下负载只能是一行：除结尾换行外不得再含 `\n`。
    ///
    /// 行协议的接收方按行切分消息，多出的行会被当作下一条端口命令。
    pub fn ensure_single_line(&self) -> Result<()> {
        if !self.text_mode {
            return Ok(());
        }
        let chunks = self.blocks.iter().map(Bytes::as_ref).chain([&self.pending[..]]);
        check_single_line(chunks)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.blocks.iter().all(Bytes::is_empty)
    }

    /// 已写入的总字节数。
    pub fn total_len(&self) -> usize {
        self.pending.len() + self.blocks.iter().map(Bytes::len).sum::<usize>()
    }

    fn seal(&mut self) {
        if !self.pending.is_empty() {
            self.blocks.push(self.pending.split().freeze());
        }
    }

    /// 取出全部块。
    pub fn into_blocks(mut self) -> Vec<Bytes> {
        self.seal();
        self.blocks
    }
}

/// 依次检查各段拼接后的文本是否至多以一个换行结尾。
pub(crate) fn check_single_line<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Result<()> {
    let mut seen_newline = false;
    for byte in chunks.into_iter().flatten() {
        if seen_newline {
            return Err(PortError::protocol(
                "line carriers carry exactly one payload line per message",
            ));
        }
        seen_newline = *byte == b'\n';
    }
    Ok(())
}

/// Carrier 所需的“已知大小”的消息视图。
///
/// Carrier 先根据块数与块长写出索引，再依次写出各块；前 `header_length()` 个块
/// 属于端口命令，其余为用户负载。
pub trait SizedWriter: Send + Sync {
    /// 块数。
    fn length(&self) -> usize;

    /// 命令部分占用的块数。
    fn header_length(&self) -> usize;

    fn block(&self, index: usize) -> &[u8];

    fn length_of(&self, index: usize) -> usize {
        self.block(index).len()
    }

    fn total_len(&self) -> usize {
        (0..self.length()).map(|index| self.length_of(index)).sum()
    }

    fn is_text_mode(&self) -> bool;

    /// 发送方是否会等待回复。
    fn reply_expected(&self) -> bool;
}

/// 一条完整待发送的消息：命令块 + 负载块。
#[derive(Clone, Debug, Default)]
pub struct SizedMessage {
    blocks: Vec<Bytes>,
    header_length: usize,
    text_mode: bool,
    reply_expected: bool,
}

impl SizedMessage {
    /// 由命令写入器与负载写入器组装。块数超过 [`MAX_BLOCKS`] 时负载被合并为单块。
    pub fn assemble(
        command: Option<ConnectionWriter>,
        body: ConnectionWriter,
        reply_expected: bool,
    ) -> Self {
        let text_mode = body.is_text_mode();
        let header: Vec<Bytes> = command
            .map(ConnectionWriter::into_blocks)
            .unwrap_or_default();
        let mut payload: Vec<Bytes> = body
            .into_blocks()
            .into_iter()
            .filter(|block| !block.is_empty())
            .collect();
        if header.len() + payload.len() > MAX_BLOCKS {
            let mut merged = BytesMut::with_capacity(payload.iter().map(Bytes::len).sum());
            for block in &payload {
                merged.extend_from_slice(block);
            }
            payload = vec![merged.freeze()];
        }
        let header_length = header.len();
        let mut blocks = header;
        blocks.extend(payload);
        Self {
            blocks,
            header_length,
            text_mode,
            reply_expected,
        }
    }

    /// 只有负载、没有命令的消息（回复、不支持转义的 Carrier）。
    pub fn payload(body: ConnectionWriter) -> Self {
        Self::assemble(None, body, false)
    }

    /// 拼接后的完整字节。
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_len());
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out.freeze()
    }
}

impl SizedWriter for SizedMessage {
    fn length(&self) -> usize {
        self.blocks.len()
    }

    fn header_length(&self) -> usize {
        self.header_length
    }

    fn block(&self, index: usize) -> &[u8] {
        self.blocks.get(index).map(Bytes::as_ref).unwrap_or_default()
    }

    fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    fn reply_expected(&self) -> bool {
        self.reply_expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_share_a_block_and_external_blocks_stay_separate() {
        let mut writer = ConnectionWriter::new(false);
        writer.append_i32(1);
        writer.append_i32(2);
        writer.append_block(Bytes::from_static(b"zero-copy"));
        writer.append_string("hi");
        assert_eq!(writer.total_len(), 8 + 9 + 4 + 3);

        let mut command = ConnectionWriter::new(false);
        command.append_raw(b"CMD");
        let message = SizedMessage::assemble(Some(command), writer, true);
        assert_eq!(message.length(), 4);
        assert_eq!(message.header_length(), 1);
        assert_eq!(message.block(2), b"zero-copy");
        assert_eq!(message.total_len(), 3 + 8 + 9 + 7);
        assert!(message.reply_expected());
    }

    #[test]
    fn too_many_blocks_are_coalesced() {
        let mut writer = ConnectionWriter::new(false);
        for _ in 0..300 {
            writer.append_block(Bytes::from_static(b"x"));
        }
        let message = SizedMessage::payload(writer);
        assert_eq!(message.length(), 1);
        assert_eq!(message.total_len(), 300);
    }

    #[test]
    fn text_payload_must_fit_on_one_line() {
        let mut line = ConnectionWriter::new(true);
        line.append_line("alpha");
        assert!(line.ensure_single_line().is_ok());

        let mut split = ConnectionWriter::new(true);
        split.append_block(Bytes::from_static(b"alpha\n"));
        split.append_raw(b"beta");
        assert!(matches!(
            split.ensure_single_line(),
            Err(PortError::Protocol { .. })
        ));

        let mut binary = ConnectionWriter::new(false);
        binary.append_raw(b"alpha\nbeta");
        assert!(binary.ensure_single_line().is_ok());
    }
}
