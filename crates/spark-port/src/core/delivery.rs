use tokio::sync::oneshot;

use crate::contact::Route;
use crate::error::{PortError, Result};
use crate::io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter};

/// 投递给端口拥有者的一条入站消息。
///
/// # 教案式注释
/// - **意图 (Why)**：发送方可能在等待回复，拥有者处理完才能决定回复内容；
///   输入单元因此在投递后等待本对象被回复或丢弃；
/// - **契约 (What)**：
///   - `reply` 只能调用一次，且仅当 `expects_reply()` 为真；
///   - 不回复直接丢弃时，发送方收到空回复，连接保持可用。
#[derive(Debug)]
pub struct Delivery {
    reader: ConnectionReader,
    reply: Option<oneshot::Sender<ConnectionWriter>>,
}

impl Delivery {
    pub(crate) fn new(reader: ConnectionReader, reply: Option<oneshot::Sender<ConnectionWriter>>) -> Self {
        Self { reader, reply }
    }

    /// 消息所在连接的路由。
    pub fn route(&self) -> &Route {
        self.reader.route()
    }

    /// 发送方附带的信封文本。
    pub fn envelope(&self) -> &str {
        self.reader.envelope()
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reader(&mut self) -> &mut ConnectionReader {
        &mut self.reader
    }

    /// 以 `target` 反序列化消息体。
    pub fn read_into(&mut self, target: &mut dyn PortReader) -> Result<()> {
        target.read(&mut self.reader)
    }

    /// 回复发送方。
    pub fn reply(mut self, content: &dyn PortWriter) -> Result<()> {
        let Some(sender) = self.reply.take() else {
            return Err(PortError::NotAllowed {
                detail: "sender did not ask for a reply".to_owned(),
            });
        };
        let mut writer = ConnectionWriter::new(self.reader.is_text_mode());
        content.write(&mut writer)?;
        writer.ensure_single_line()?;
        if sender.send(writer).is_err() {
            tracing::debug!(route = %self.reader.route(), "reply dropped; connection already gone");
        }
        Ok(())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(sender) = self.reply.take() {
            let _ = sender.send(ConnectionWriter::new(self.reader.is_text_mode()));
        }
    }
}
