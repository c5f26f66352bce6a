#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：为端口连接核心提供 Tokio 上的 TCP 流，既用于面向连接的 Carrier（`tcp`、`text`），
  也用于 UDP Carrier 的引导握手。
- **设计理念**：所有阻塞点都经过 [`run_with_context`](spark_transport::run_with_context)，
  单元的 `close()` 通过中断句柄即可让阻塞在读上的任务立即返回。

## 核心契约（What）
- [`TcpListener`]：绑定、接受连接、查询本地地址；
- [`TcpChannel`]：实现 [`TwoWayStream`](spark_transport::TwoWayStream)，读写各自独占一个半部，
  支持按方向半关闭。

## 实现策略（How）
- 连接建立后立即 `into_split`，读半部与写半部互不阻塞；
- 半关闭读方向借助 `socket2::SockRef`，Tokio 本身只提供写方向的关闭；
- 错误统一映射为带稳定错误码的 [`TransportError`](spark_transport::TransportError)。
"#]

mod channel;
mod error;
mod listener;

pub use channel::TcpChannel;
pub use listener::TcpListener;
