//! 数据报通道：包内写入合并为一个数据报，接收方可分段读取。

use spark_transport::{IoContext, ShutdownDirection, TransportSocketAddr, TwoWayStream};
use spark_transport_udp::DatagramChannel;

/// 一个包内的多次写入在接收端表现为同一数据报，并按写入顺序拼接。
#[tokio::test(flavor = "multi_thread")]
async fn packet_writes_form_one_datagram() {
    let ctx = IoContext::new();
    let mut receiver = DatagramChannel::bind(TransportSocketAddr::loopback_v4(0))
        .await
        .expect("绑定接收端");
    let mut sender = DatagramChannel::bind(TransportSocketAddr::loopback_v4(0))
        .await
        .expect("绑定发送端")
        .with_peer(receiver.local_socket_addr());

    sender.begin_packet();
    sender.write_all(&ctx, b"hello ").await.expect("包内写入");
    sender.write_all(&ctx, b"world").await.expect("包内写入");
    sender.end_packet(&ctx).await.expect("发出数据报");

    let mut head = [0u8; 6];
    assert_eq!(receiver.read(&ctx, &mut head).await.expect("读取前半"), 6);
    let mut tail = [0u8; 16];
    let n = receiver.read(&ctx, &mut tail).await.expect("读取后半");
    assert_eq!(&head, b"hello ");
    assert_eq!(&tail[..n], b"world");
    assert_eq!(receiver.peer_addr(), Some(sender.local_socket_addr()));

    receiver
        .shutdown(&ctx, ShutdownDirection::Both)
        .await
        .expect("关闭");
    assert!(!receiver.is_ok());
    assert!(receiver.read(&ctx, &mut tail).await.is_err());
}

/// 未设置对端时写入以 `Closed` 失败。
#[tokio::test(flavor = "multi_thread")]
async fn writing_without_peer_fails() {
    let ctx = IoContext::new();
    let mut lonely = DatagramChannel::bind(TransportSocketAddr::loopback_v4(0))
        .await
        .expect("绑定");
    let err = lonely.write_all(&ctx, b"x").await.expect_err("没有对端");
    assert!(err.is_closed());
}
