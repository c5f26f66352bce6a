//! 端口拥有者使用的门面。

use std::sync::Arc;

use crate::config::PortConfig;
use crate::contact::{Contact, Route};
use crate::core::{Delivery, PortCore, PortReport, SendOptions, SendReport};
use crate::error::{PortError, Result};
use crate::io::{ConnectionReader, PortReader, PortWriter};
use crate::network::Network;

/// 一个命名端口。
///
/// # 教案式注释
/// - **意图 (Why)**：多数使用者只需要“打开、连接、写、读、关闭”，不必接触单元与协议；
/// - **契约 (What)**：
///   - `write` 按端口配置决定是否等待，连接级失败只体现在 [`SendReport`] 中；
///   - `write_with_reply` 没有收到任何回复时返回 [`PortError::NoReply`]；
///   - `close()` 可重复调用；丢弃 `Port` 不会自动关闭端口。
#[derive(Clone, Debug)]
pub struct Port {
    core: PortCore,
}

impl Port {
    /// 以 `network` 的默认配置打开端口。
    pub async fn open(network: &Network, name: &str) -> Result<Self> {
        Self::open_with(network, name, network.config().clone()).await
    }

    pub async fn open_with(network: &Network, name: &str, config: PortConfig) -> Result<Self> {
        let core = PortCore::open(network.clone(), name, config).await?;
        Ok(Self { core })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn contact(&self) -> &Contact {
        self.core.contact()
    }

    pub fn core(&self) -> &PortCore {
        &self.core
    }

    /// 建立到 `target` 的输出连接；`target` 可带 `carrier:/` 前缀。
    pub async fn connect(&self, target: &str) -> Result<String> {
        self.core.add_output(target, None).await
    }

    pub async fn connect_with(&self, target: &str, carrier: &str) -> Result<String> {
        self.core.add_output(target, Some(carrier)).await
    }

    /// 请求 `source` 把本端口作为它的输出目标，连接由本端拨出。
    pub async fn connect_reversed(&self, source: &str) -> Result<String> {
        self.core.add_reversed_input(source, None).await
    }

    pub async fn disconnect(&self, target: &str) -> Result<String> {
        self.core.remove_output(target).await
    }

    pub async fn disconnect_input(&self, source: &str) -> Result<String> {
        self.core.remove_input(source).await
    }

    /// 写给所有输出连接。
    pub async fn write<W>(&self, content: W) -> Result<SendReport>
    where
        W: PortWriter + 'static,
    {
        self.write_shared(Arc::new(content)).await
    }

    pub async fn write_shared(&self, content: Arc<dyn PortWriter>) -> Result<SendReport> {
        self.core
            .send(content, SendOptions::from_config(self.core.config()))
            .await
    }

    pub async fn write_with(&self, content: Arc<dyn PortWriter>, options: SendOptions) -> Result<SendReport> {
        self.core.send(content, options).await
    }

    /// 写出并等待回复。
    pub async fn write_with_reply<W>(&self, content: W) -> Result<ConnectionReader>
    where
        W: PortWriter + 'static,
    {
        let options = SendOptions::from_config(self.core.config()).with_reply();
        let report = self.core.send(Arc::new(content), options).await?;
        report.reply.ok_or_else(|| PortError::NoReply {
            port: self.core.name().to_owned(),
        })
    }

    /// 阻塞读取下一条消息。
    pub async fn read(&self) -> Option<Delivery> {
        self.core.read(true).await
    }

    pub async fn try_read(&self) -> Option<Delivery> {
        self.core.read(false).await
    }

    /// 读取下一条消息并以 `target` 反序列化；消息请求的回复为空。
    pub async fn read_into(&self, target: &mut dyn PortReader) -> Result<Option<Route>> {
        let Some(mut delivery) = self.core.read(true).await else {
            return Ok(None);
        };
        delivery.read_into(target)?;
        Ok(Some(delivery.route().clone()))
    }

    pub fn set_read_handler(&self, handler: impl PortReader + 'static) {
        self.core.set_read_handler(Box::new(handler));
    }

    pub fn set_envelope(&self, envelope: &str) {
        self.core.set_envelope(envelope);
    }

    pub fn last_envelope(&self) -> String {
        self.core.last_envelope()
    }

    pub fn input_count(&self) -> usize {
        self.core.input_count()
    }

    pub fn output_count(&self) -> usize {
        self.core.output_count()
    }

    /// 是否仍有消息在写出。
    pub fn is_writing(&self) -> bool {
        self.core.is_writing()
    }

    /// 接收连接建立与移除事件。
    pub fn set_report_callback(&self, reporter: Arc<dyn PortReport>) {
        self.core.set_report_callback(reporter);
    }

    pub fn reset_report_callback(&self) {
        self.core.reset_report_callback();
    }

    pub fn interrupt(&self) {
        self.core.interrupt();
    }

    pub fn resume(&self) {
        self.core.resume();
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
