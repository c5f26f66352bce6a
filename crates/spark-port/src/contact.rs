//! 端点地址（[`Contact`]）与逻辑连接标识（[`Route`]）。

use std::fmt;
use std::net::IpAddr;

use spark_transport::TransportSocketAddr;

use crate::error::{PortError, Result};

/// 主机文本转为 IP；只接受 IP 字面量与 `localhost`。
pub(crate) fn resolve_host(host: &str) -> Option<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::from([127, 0, 0, 1]));
    }
    host.parse().ok()
}

/// 路由模式中的通配符。
pub const ANY: &str = "*";

/// 一个端点的不可变地址。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 名字服务登记与查询、Face 建连都以它为载体；
/// - `carrier` 记录对端偏好的 Carrier，连接时未显式指定 Carrier 便采用它。
///
/// ## 契约（What）
/// - `is_valid()` 要求主机与端口均已知；名字服务查询失败时调用方不会得到 `Contact`；
/// - 文本形式为 `carrier:/host:port`，无 Carrier 时为 `host:port`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Contact {
    name: String,
    host: String,
    port: u16,
    carrier: String,
}

impl Contact {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            carrier: String::new(),
        }
    }

    /// 由套接字地址构造；未指定地址会被替换为回环地址，以便登记后可被连接。
    pub fn from_socket_addr(name: impl Into<String>, addr: TransportSocketAddr) -> Self {
        let host = if addr.is_unspecified() {
            "127.0.0.1".to_owned()
        } else {
            addr.host()
        };
        Self::new(name, host, addr.port())
    }

    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// 解析为可连接的套接字地址。
    pub fn socket_addr(&self) -> Result<TransportSocketAddr> {
        if !self.is_valid() {
            return Err(PortError::NameNotFound {
                name: self.name.clone(),
            });
        }
        let ip = resolve_host(&self.host).ok_or_else(|| PortError::ConnectionRefused {
            target: self.to_string(),
            detail: format!("`{}` is not an IP address", self.host),
        })?;
        Ok(TransportSocketAddr::from(std::net::SocketAddr::new(
            ip, self.port,
        )))
    }

    /// 解析 `carrier:/host:port` 或 `host:port`。
    pub fn parse(text: &str) -> Option<Self> {
        let (carrier, rest) = match text.split_once(":/") {
            Some((carrier, rest)) if !carrier.contains('.') => {
                (carrier, rest.trim_start_matches('/'))
            }
            _ => ("", text),
        };
        let (host, port) = rest.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Contact::new("", host, port).with_carrier(carrier))
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.carrier.is_empty() {
            write!(f, "{}:/", self.carrier)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 逻辑连接 `(源端口, 目标端口, Carrier)`。
///
/// 与底层套接字无关，用于诊断输出、按模式删除连接以及识别反向连接。
/// 任一字段为 [`ANY`] 时，作为模式可匹配任意值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Route {
    from: String,
    to: String,
    carrier: String,
}

impl Route {
    pub fn new(from: impl Into<String>, to: impl Into<String>, carrier: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            carrier: carrier.into(),
        }
    }

    /// 匹配任意连接的模式。
    pub fn any() -> Self {
        Self::new(ANY, ANY, ANY)
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }

    /// 交换源与目标。
    pub fn swap(&self) -> Self {
        Self::new(self.to.clone(), self.from.clone(), self.carrier.clone())
    }

    /// `self` 作为模式时是否匹配 `route`。
    pub fn matches(&self, route: &Route) -> bool {
        field_matches(&self.from, &route.from)
            && field_matches(&self.to, &route.to)
            && field_matches(&self.carrier, &route.carrier)
    }
}

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == ANY || pattern == value
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}->{}", self.from, self.carrier, self.to)
    }
}

/// 拆分连接目标中的 Carrier 前缀：`udp://r` → (`Some("udp")`, `/r`)。
///
/// 没有前缀时返回 `None`，端口名补齐前导 `/`。
pub fn split_carrier(target: &str) -> (Option<&str>, String) {
    let (carrier, name) = match target.split_once(":/") {
        Some((carrier, rest)) if !carrier.is_empty() && !carrier.contains('/') => {
            (Some(carrier), rest.trim_start_matches('/'))
        }
        _ => (None, target.trim_start_matches('/')),
    };
    (carrier, format!("/{name}"))
}
