//! # protocol：单条连接的生命周期编排
//!
//! ## 角色定位（Why）
//! - [`Protocol`] 在 Carrier 认领之前持有原始流，握手时把每一步转交给 Carrier，
//!   并同步推进 [`ConnectionPhase`]；
//! - 输入单元与输出单元都只通过本类型收发消息，不直接接触 Carrier。
//!
//! ## 契约（What）
//! - 握手任一步失败即连接失败，调用方负责关闭；
//! - `close()` 可重复调用，挂起的确认会先发出。

mod state;

use bytes::Bytes;
use spark_transport::{InterruptHandle, IoContext, TwoWayStream};
use std::time::Duration;

pub use state::{ConnectionPhase, ConnectionState};

use crate::carrier::{Carrier, CarrierFlags, CarrierRegistry, HEADER_LEN};
use crate::contact::Route;
use crate::error::{PortError, Result};
use crate::io::{ConnectionReader, SizedWriter};

const DEFAULT_CARRIER: &str = "tcp";

/// 头不被识别时写回对端的说明，便于用 telnet 误连的人类理解发生了什么。
const NOT_A_PORT_HELP: &str = "* Error. Protocol not found.\r\n\
* Hello. You appear to be trying to communicate with a port.\r\n\
* The first 8 bytes sent to a port are important.\r\n\
* They identify the protocol that will be used.\r\n\
* To talk as a human, send CONNECT followed by a name.\r\n\
* Bye bye.\r\n";

fn no_carrier() -> PortError {
    PortError::protocol("connection has no negotiated carrier")
}

/// 一条连接：流、阶段与协商出的 Carrier。
#[derive(Debug)]
pub struct Protocol {
    state: ConnectionState,
    carrier: Option<Box<dyn Carrier>>,
    pending_ack: bool,
    closed: bool,
}

impl Protocol {
    pub fn new(stream: Box<dyn TwoWayStream>, ctx: IoContext) -> Self {
        Self {
            state: ConnectionState::new(stream, ctx),
            carrier: None,
            pending_ack: false,
            closed: false,
        }
    }

    /// 发送方握手。路由的 Carrier 为空时使用 `tcp`。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：按名称创建 Carrier → `prepare_send` → `send_header` → 刷新 →
    ///   `expect_reply_to_header`；成功后路由的 Carrier 字段记录实际使用的名称；
    /// - **契约 (What)**：失败时本对象不可再用，调用方应 `close()`。
    pub async fn open(&mut self, registry: &CarrierRegistry, route: Route) -> Result<()> {
        let name = if route.carrier().is_empty() {
            DEFAULT_CARRIER
        } else {
            route.carrier()
        };
        let mut carrier = registry
            .lookup_carrier(name)
            .ok_or_else(|| PortError::UnknownCarrier {
                name: name.to_owned(),
            })?;
        let route = route.with_carrier(carrier.name());
        self.state.set_route(route);
        self.state.advance(ConnectionPhase::CarrierNegotiated)?;
        carrier.prepare_send(&mut self.state).await?;
        carrier.send_header(&mut self.state).await?;
        self.state.flush().await?;
        carrier.expect_reply_to_header(&mut self.state).await?;
        self.state.advance(ConnectionPhase::IndexExchanged)?;
        tracing::debug!(route = %self.state.route(), "outgoing handshake complete");
        self.carrier = Some(carrier);
        Ok(())
    }

    /// 接收方握手：读取 8 字节头并选择 Carrier。
    ///
    /// 头不被任何已注册 Carrier 识别时，尽力写回说明文字并返回 [`PortError::HeaderMismatch`]。
    pub async fn accept(&mut self, registry: &CarrierRegistry, port_name: &str) -> Result<()> {
        let raw = self.state.read_exact(HEADER_LEN).await?;
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw);
        let Some(mut carrier) = registry.choose_carrier(&header) else {
            if self.state.write_all(NOT_A_PORT_HELP.as_bytes()).await.is_ok() {
                let _ = self.state.flush().await;
            }
            return Err(PortError::HeaderMismatch { header });
        };
        self.state
            .set_route(Route::new("", port_name, carrier.name()));
        self.state.advance(ConnectionPhase::CarrierNegotiated)?;
        carrier.expect_sender_specifier(&mut self.state).await?;
        carrier.expect_extra_header(&mut self.state).await?;
        carrier.respond_to_header(&mut self.state).await?;
        self.state.flush().await?;
        self.state.advance(ConnectionPhase::IndexExchanged)?;
        tracing::debug!(route = %self.state.route(), "incoming handshake complete");
        self.carrier = Some(carrier);
        Ok(())
    }

    /// 写出一条消息；`want_reply` 且 Carrier 支持回复时返回回复帧。
    pub async fn write(
        &mut self,
        message: &dyn SizedWriter,
        want_reply: bool,
    ) -> Result<Option<Bytes>> {
        let flags = self.flags();
        self.state.advance(ConnectionPhase::PayloadStreaming)?;
        let Some(carrier) = self.carrier.as_mut() else {
            return Err(no_carrier());
        };
        self.state.begin_packet();
        carrier.write(&mut self.state, message).await?;
        self.state.end_packet().await?;
        self.state.flush().await?;

        let reply = if want_reply && flags.supports_reply {
            self.state.advance(ConnectionPhase::ReplyPending)?;
            Some(carrier.expect_reply(&mut self.state).await?)
        } else {
            if want_reply {
                tracing::info!(
                    route = %self.state.route(),
                    "connection does not support replies (try \"tcp\" or \"text_ack\")"
                );
            }
            None
        };
        if flags.requires_ack {
            carrier.expect_ack(&mut self.state).await?;
        }
        self.state.advance(ConnectionPhase::IndexExchanged)?;
        Ok(reply)
    }

    /// 读入下一条消息。
    pub async fn begin_read(&mut self) -> Result<ConnectionReader> {
        let text_mode = self.flags().text_mode;
        self.state.discard_residue();
        let Some(carrier) = self.carrier.as_mut() else {
            return Err(no_carrier());
        };
        let data = carrier.expect_index(&mut self.state).await?;
        self.pending_ack = true;
        self.state.advance(ConnectionPhase::PayloadStreaming)?;
        Ok(ConnectionReader::new(data, text_mode).with_route(self.state.route().clone()))
    }

    /// 发回回复。
    pub async fn reply(&mut self, message: &dyn SizedWriter) -> Result<()> {
        self.state.advance(ConnectionPhase::ReplyPending)?;
        let Some(carrier) = self.carrier.as_mut() else {
            return Err(no_carrier());
        };
        carrier.reply(&mut self.state, message).await?;
        self.state.flush().await
    }

    /// 文本模式下直接写给人类的若干行。
    pub async fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        let mut text = String::new();
        for line in lines {
            text.push_str(line);
            text.push_str("\r\n");
        }
        self.state.write_all(text.as_bytes()).await?;
        self.state.flush().await
    }

    /// 结束当前消息，需要时发出确认。
    pub async fn end_read(&mut self) -> Result<()> {
        self.send_pending_ack().await?;
        if self.state.phase() != ConnectionPhase::IndexExchanged {
            self.state.advance(ConnectionPhase::IndexExchanged)?;
        }
        Ok(())
    }

    async fn send_pending_ack(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.pending_ack) {
            return Ok(());
        }
        let requires_ack = self.flags().requires_ack;
        let Some(carrier) = self.carrier.as_mut() else {
            return Ok(());
        };
        if requires_ack {
            carrier.send_ack(&mut self.state).await?;
            self.state.flush().await?;
        }
        Ok(())
    }

    pub fn flags(&self) -> CarrierFlags {
        self.carrier
            .as_ref()
            .map(|carrier| carrier.flags())
            .unwrap_or_default()
    }

    pub fn carrier_name(&self) -> Option<&str> {
        self.carrier.as_ref().map(|carrier| carrier.name())
    }

    pub fn route(&self) -> &Route {
        self.state.route()
    }

    /// 改写路由（反向连接时交换方向）。
    pub fn set_route(&mut self, route: Route) {
        self.state.set_route(route);
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    /// 可从其它任务强制中断本连接的句柄。
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.state.interrupt_handle()
    }

    /// 强制中断正在阻塞的读写。
    pub fn interrupt(&self) {
        self.state.interrupt_handle().interrupt();
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.state.set_timeout(timeout);
    }

    pub fn is_ok(&self) -> bool {
        !self.closed && self.state.check_streams()
    }

    /// 关闭连接；可重复调用。
    pub async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if !self.state.ctx().is_interrupted()
            && let Err(err) = self.send_pending_ack().await
        {
            tracing::debug!(code = err.code(), "pending acknowledgement lost on close");
        }
        self.state.shutdown().await;
        let _ = self.state.advance(ConnectionPhase::Closed);
    }
}
