#![deny(unsafe_code)]
#![doc = r#"
# spark-port

## 模块使命（Why）
- **命名端口**：进程以名字（如 `/camera/left`）打开端口，其它端口按名字连接过来，
  一个端口可以同时向多个接收方写、从多个发送方读；
- **协议可替换**：每条连接在开头的 8 字节头中声明 Carrier，`tcp`、`text`、`udp` 等
  以策略对象实现，端口核心只按 [`CarrierFlags`] 编排握手与收发；
- **故障隔离**：一条连接失效只剪除它自己，广播写入照常送达其余接收方。

## 核心契约（What）
- [`Port`]：打开、连接、写、读、关闭；
- [`PortCore`]：输入/输出单元集合、扇出写入、投递队列、管理命令；
- [`Protocol`] + [`Carrier`]：单条连接的握手与消息帧；
- [`PortCorePackets`]：扇出消息的生命周期，所有连接写完后恰好回收一次；
- [`Network`]：Carrier 注册表与名字服务的显式上下文，不存在进程级单例。

## 实现策略（How）
- 每个单元一个 Tokio 任务，输出单元以单许可信号量保证同一连接至多一条消息在途；
- 阻塞 IO 一律经 [`IoContext`](spark_transport::IoContext)，`close()` 通过中断句柄唤醒；
- 日志使用 `tracing` 结构化字段，错误使用带稳定错误码的 [`PortError`]。
"#]

pub mod bottle;
pub mod carrier;
pub mod command;
pub mod config;
pub mod contact;
pub mod core;
pub mod error;
pub mod face;
pub mod io;
pub mod logging;
pub mod name;
pub mod network;
pub mod packet;
pub mod port;
pub mod protocol;
pub mod unit;

pub use bottle::{Bottle, Value};
pub use carrier::{Carrier, CarrierFlags, CarrierRegistry};
pub use command::PortCommand;
pub use config::{PortConfig, PortFlags};
pub use contact::{Contact, Route};
pub use crate::core::{
    Delivery, PortCore, PortInfo, PortReport, SendOptions, SendReport, WeakPortCore,
};
pub use error::{PortError, Result};
pub use face::{Face, TcpFace};
pub use io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter, SizedWriter};
pub use name::{MemoryNameService, NameClient};
pub use network::Network;
pub use packet::{PacketHandle, PortCorePackets};
pub use port::Port;
pub use protocol::{ConnectionPhase, Protocol};
pub use unit::{InputUnit, OutputUnit, SendStatus, UnitState};
