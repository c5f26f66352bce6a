//! # carrier：连接级协议策略
//!
//! ## 角色定位（Why）
//! - 每种 Carrier 描述一种线上协议的握手与帧格式；端口核心只面对 [`Carrier`] 这一扁平接口，
//!   差异通过 [`CarrierFlags`] 与少量可覆盖的钩子表达；
//! - 注册表中保存的是模板，每条新连接通过 `create()` 得到独立实例，连接之间不共享可变状态。
//!
//! ## 调用顺序（How）
//! - 发送方：`prepare_send` → `send_header` → `expect_reply_to_header` → 多次 `write`
//!   （需要时 `expect_reply`、`expect_ack`）；
//! - 接收方：注册表以 `check_header` 选中模板 → `set_parameters` → `expect_sender_specifier`
//!   → `expect_extra_header` → `respond_to_header` → 多次 `expect_index`（需要时 `reply`、`send_ack`）。
//!
//! ## 契约（What）
//! - Carrier 在握手时选定，连接存续期间不再改变；
//! - 握手失败即连接失败，本层不做重试。

mod header;
mod registry;
mod tcp;
mod text;
mod udp;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use header::{
    HEADER_LEN, MAGIC_BASE, parse_yarp_number, read_yarp_number, specifier_of, write_yarp_number,
    yarp_number,
};
pub use registry::CarrierRegistry;
pub use tcp::TcpCarrier;
pub use text::TextCarrier;
pub use udp::UdpCarrier;

use crate::error::Result;
use crate::io::SizedWriter;
use crate::protocol::ConnectionState;

/// Carrier 能力位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CarrierFlags {
    /// 无连接传输（UDP）。
    pub connectionless: bool,
    /// 消息前可携带端口命令。
    pub can_escape: bool,
    /// 支持 RPC 式回复。
    pub supports_reply: bool,
    /// 每条消息后接收方需发送确认。
    pub requires_ack: bool,
    /// 以文本行收发。
    pub text_mode: bool,
}

/// 一种线上协议。
#[async_trait]
pub trait Carrier: Send + Sync + fmt::Debug {
    /// 注册名；别名实例返回别名。
    fn name(&self) -> &str;

    fn flags(&self) -> CarrierFlags;

    /// 为新连接克隆一个实例。
    fn create(&self) -> Box<dyn Carrier>;

    /// 按名称（含别名）创建实例。
    fn create_named(&self, name: &str) -> Option<Box<dyn Carrier>> {
        (name == self.name()).then(|| self.create())
    }

    /// 8 字节头是否属于本 Carrier。
    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool;

    /// 本实例发送的 8 字节头。
    fn header(&self) -> [u8; HEADER_LEN];

    /// 接收方根据收到的头调整实例参数（例如确认位）。
    fn set_parameters(&mut self, _header: &[u8; HEADER_LEN]) {}

    async fn prepare_send(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// 写出头与发送方名字。
    async fn send_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        state.write_all(&self.header()).await?;
        let from = state.route().from().to_owned();
        header::send_sender_specifier(state, &from).await
    }

    async fn expect_reply_to_header(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// 读取发送方名字并写入路由的 `from`。
    async fn expect_sender_specifier(&mut self, state: &mut ConnectionState) -> Result<()> {
        let from = header::expect_sender_specifier(state).await?;
        let route = state.route().clone().with_from(from);
        state.set_route(route);
        Ok(())
    }

    async fn expect_extra_header(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    async fn respond_to_header(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// 写出一条消息（索引 + 数据块）。
    async fn write(&mut self, state: &mut ConnectionState, message: &dyn SizedWriter) -> Result<()> {
        header::send_index(state, message).await
    }

    /// 读入一条完整消息。
    async fn expect_index(&mut self, state: &mut ConnectionState) -> Result<Bytes> {
        header::expect_index(state).await
    }

    async fn reply(&mut self, state: &mut ConnectionState, message: &dyn SizedWriter) -> Result<()> {
        header::send_index(state, message).await
    }

    async fn expect_reply(&mut self, state: &mut ConnectionState) -> Result<Bytes> {
        header::expect_index(state).await
    }

    async fn send_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        write_yarp_number(state, 0).await
    }

    async fn expect_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        header::expect_ack(state).await
    }
}
