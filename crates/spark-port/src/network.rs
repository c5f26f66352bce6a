//! # network：显式的进程级上下文
//!
//! ## 角色定位（Why）
//! - Carrier 注册表、名字服务与默认配置都由 [`Network`] 持有并注入端口，不存在隐藏的全局单例；
//! - 同时提供不依赖本地端口的一次性管理操作：让远端端口连接、断开或回答管理命令。
//!
//! ## 契约（What）
//! - 克隆共享同一注册表与名字服务；
//! - `admin` 以来源名 `admin` 建立一次性 `tcp` 连接，发送 `a` 命令并等待回复后断开。

use std::sync::Arc;

use spark_transport::IoContext;

use crate::bottle::Bottle;
use crate::carrier::CarrierRegistry;
use crate::command::PortCommand;
use crate::config::PortConfig;
use crate::contact::{Contact, Route, split_carrier};
use crate::error::{PortError, Result};
use crate::face::tcp_connect;
use crate::io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter, SizedMessage};
use crate::name::{MemoryNameService, NameClient};
use crate::protocol::Protocol;

/// 管理连接使用的来源名。
pub const ADMIN_SOURCE: &str = "admin";

/// 端口共享的协作者集合。
#[derive(Clone)]
pub struct Network {
    carriers: Arc<CarrierRegistry>,
    names: Arc<dyn NameClient>,
    config: Arc<PortConfig>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("carriers", &self.carriers.names())
            .field("config", &self.config)
            .finish()
    }
}

impl Network {
    /// 进程内网络：默认 Carrier 集合 + 内存名字服务 + 默认配置。
    pub fn local() -> Self {
        Self::new(
            Arc::new(CarrierRegistry::with_defaults()),
            Arc::new(MemoryNameService::new()),
        )
    }

    pub fn new(carriers: Arc<CarrierRegistry>, names: Arc<dyn NameClient>) -> Self {
        Self {
            carriers,
            names,
            config: Arc::new(PortConfig::default()),
        }
    }

    /// 替换新端口默认使用的配置。
    pub fn with_config(mut self, config: PortConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn carriers(&self) -> &CarrierRegistry {
        &self.carriers
    }

    pub fn names(&self) -> &dyn NameClient {
        self.names.as_ref()
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// 查询端口地址。
    pub fn query(&self, name: &str) -> Option<Contact> {
        let (_, name) = split_carrier(name);
        self.names.query_name(&name)
    }

    /// 向 `target` 发送一条管理命令并返回回复。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：解析名字 → 建连并以 `tcp` 握手 → 写出 `a` 命令与请求 Bottle，
    ///   等待回复 → 尽力发送 `q` 后关闭连接；
    /// - **契约 (What)**：名字未登记返回 [`PortError::NameNotFound`]，建连或握手失败返回
    ///   [`PortError::ConnectionRefused`]，对端未回复返回 [`PortError::NoReply`]。
    pub async fn admin(&self, target: &str, request: &Bottle) -> Result<Bottle> {
        let (_, target) = split_carrier(target);
        let contact = self
            .names
            .query_name(&target)
            .ok_or_else(|| PortError::NameNotFound {
                name: target.clone(),
            })?;
        let ctx = IoContext::new().with_timeout(self.config.timeout());
        let stream = tcp_connect(&contact, &ctx).await?;
        let mut protocol = Protocol::new(stream, ctx);
        let route = Route::new(ADMIN_SOURCE, target.as_str(), "tcp");
        if let Err(err) = protocol.open(&self.carriers, route).await {
            protocol.close().await;
            return Err(PortError::ConnectionRefused {
                target,
                detail: err.to_string(),
            });
        }

        let outcome = exchange(&mut protocol, request).await;
        if outcome.is_ok() {
            let mut quit = ConnectionWriter::new(false);
            PortCommand::quit().write(&mut quit);
            let message = SizedMessage::assemble(Some(quit), ConnectionWriter::new(false), false);
            if let Err(err) = protocol.write(&message, false).await {
                tracing::debug!(code = err.code(), "admin quit not delivered");
            }
        }
        protocol.close().await;
        let reply = outcome?.ok_or(PortError::NoReply { port: target })?;
        let mut response = Bottle::new();
        response.read(&mut ConnectionReader::new(reply, false))?;
        Ok(response)
    }

    /// 让 `source` 建立到 `target` 的输出连接。
    pub async fn connect(&self, source: &str, target: &str, carrier: Option<&str>) -> Result<String> {
        let mut request = Bottle::new();
        request.add_vocab("add").push(target);
        if let Some(carrier) = carrier {
            request.push(carrier);
        }
        let response = self.admin(source, &request).await?;
        check_status(source, target, &response)
    }

    /// 让 `source` 断开到 `target` 的输出连接。
    pub async fn disconnect(&self, source: &str, target: &str) -> Result<String> {
        let mut request = Bottle::new();
        request.add_vocab("del").push(target);
        let response = self.admin(source, &request).await?;
        check_status(source, target, &response)
    }
}

async fn exchange(protocol: &mut Protocol, request: &Bottle) -> Result<Option<bytes::Bytes>> {
    let mut command = ConnectionWriter::new(false);
    PortCommand::admin().write(&mut command);
    let mut body = ConnectionWriter::new(false);
    request.write(&mut body)?;
    let message = SizedMessage::assemble(Some(command), body, true);
    protocol.write(&message, true).await
}

fn check_status(source: &str, target: &str, response: &Bottle) -> Result<String> {
    let message = response
        .get(1)
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_owned();
    match response.get(0).and_then(|value| value.as_int()) {
        Some(0) => Ok(message),
        _ => {
            tracing::debug!(source, target, reply = %response, "admin request refused");
            Err(PortError::ConnectionRefused {
                target: target.to_owned(),
                detail: message,
            })
        }
    }
}
