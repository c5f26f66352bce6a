#![doc = r#"
# spark-transport-udp

## 模块使命（Why）
- **流迁移的落点**：`udp` Carrier 先在 TCP 上完成握手，随后双方通过 `takeStreams`
  换成本 crate 的 [`DatagramChannel`]，消息以单个数据报承载。
- **统一契约**：实现 [`TwoWayStream`](spark_transport::TwoWayStream)，Protocol 无需感知底层是字节流还是报文。

## 核心契约（What）
- `begin_packet`/`end_packet` 之间的写入累积为一个数据报，`end_packet` 时整体发出；
- 读取以数据报为单位缓冲，调用方可以分多次读完一个数据报；
- 尽力而为：丢包、乱序由上层接受，不做重传。

## 实现策略（How）
- 收发直接委托 Tokio `UdpSocket`，每次阻塞都经过 [`run_with_context`](spark_transport::run_with_context)；
- 接收方在收到首个数据报前不知道对端地址，首个数据报的源地址即被记为对端。
"#]

mod channel;

pub use channel::{DatagramChannel, MAX_DATAGRAM};
