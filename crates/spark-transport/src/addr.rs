use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// 端口、Contact 与日志共用的套接字地址表示。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Contact 需要一个可 `Copy`、可哈希、格式稳定的地址值，用于名字服务登记与诊断输出；
/// - 避免上层在 TCP/UDP 之间反复与 `std::net::SocketAddr` 互转时各写一套格式化逻辑。
///
/// ## 契约（What）
/// - `V4`/`V6` 分别承载 IPv4 与 IPv6，端口为主机序 `u16`；
/// - `Display` 输出 `a.b.c.d:port` 或 `[v6]:port`，与 `SocketAddr` 的格式保持一致；
/// - 与 `SocketAddr` 双向无损转换。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportSocketAddr {
    /// IPv4 地址。
    V4 { addr: [u8; 4], port: u16 },
    /// IPv6 地址。
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    /// 本机回环地址上的指定端口。
    pub const fn loopback_v4(port: u16) -> Self {
        Self::V4 {
            addr: [127, 0, 0, 1],
            port,
        }
    }

    /// 端口号。
    pub fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    /// 替换端口，地址部分保持不变。
    ///
    /// UDP 迁移时接收方回报新端口，发送方据此在同一主机上构造目标地址。
    pub fn with_port(self, port: u16) -> Self {
        match self {
            Self::V4 { addr, .. } => Self::V4 { addr, port },
            Self::V6 { addr, .. } => Self::V6 { addr, port },
        }
    }

    /// 地址部分的文本形式（不含端口）。
    pub fn host(&self) -> String {
        self.ip().to_string()
    }

    /// 转换为标准库 IP 地址。
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::V4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(*addr)),
            Self::V6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(*addr)),
        }
    }

    /// 是否为未指定地址（`0.0.0.0` / `::`），监听在通配地址时对外登记需要替换为回环。
    pub fn is_unspecified(&self) -> bool {
        self.ip().is_unspecified()
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::from(*self).fmt(f)
    }
}

impl From<SocketAddr> for TransportSocketAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<TransportSocketAddr> for SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        SocketAddr::new(addr.ip(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_std_format() {
        let v4 = TransportSocketAddr::loopback_v4(10_000);
        assert_eq!(v4.to_string(), "127.0.0.1:10000");

        let std_v6: SocketAddr = "[::1]:80".parse().expect("合法的 IPv6 地址");
        let v6 = TransportSocketAddr::from(std_v6);
        assert_eq!(v6.to_string(), "[::1]:80");
        assert_eq!(SocketAddr::from(v6), std_v6);
    }

    #[test]
    fn with_port_keeps_host() {
        let addr = TransportSocketAddr::loopback_v4(1).with_port(2);
        assert_eq!(addr.port(), 2);
        assert_eq!(addr.host(), "127.0.0.1");
        assert!(!addr.is_unspecified());
    }
}
