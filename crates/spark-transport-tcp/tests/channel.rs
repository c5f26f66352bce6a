//! TCP 通道的端到端行为：读写、EOF、半关闭与强制中断。

use std::time::Duration;

use spark_transport::{IoContext, ShutdownDirection, TransportSocketAddr, TwoWayStream};
use spark_transport_tcp::{TcpChannel, TcpListener};

async fn connected_pair() -> (TcpChannel, TcpChannel) {
    let listener = TcpListener::bind(TransportSocketAddr::loopback_v4(0))
        .await
        .expect("绑定回环地址");
    let addr = listener.local_addr();
    let accept = tokio::spawn(async move {
        let ctx = IoContext::new();
        listener.accept(&ctx).await.expect("接受连接").0
    });
    let client = TcpChannel::connect(&IoContext::new(), addr)
        .await
        .expect("建立连接");
    let server = accept.await.expect("accept 任务不应 panic");
    (client, server)
}

async fn read_exact(stream: &mut TcpChannel, ctx: &IoContext, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = stream.read(ctx, &mut buf[filled..]).await.expect("读取");
        assert_ne!(n, 0, "提前遇到 EOF");
        filled += n;
    }
    buf
}

/// 写入的字节按序到达，对端关闭写方向后读到 EOF 且 `is_ok` 变为 false。
#[tokio::test(flavor = "multi_thread")]
async fn bytes_arrive_in_order_and_eof_is_observed() {
    let ctx = IoContext::new();
    let (mut client, mut server) = connected_pair().await;
    assert_eq!(client.peer_addr(), Some(server.local_socket_addr()));

    client.write_all(&ctx, b"YA").await.expect("写入");
    client.write_all(&ctx, b"RP").await.expect("写入");
    client.flush(&ctx).await.expect("刷新");
    assert_eq!(read_exact(&mut server, &ctx, 4).await, b"YARP");

    client
        .shutdown(&ctx, ShutdownDirection::Write)
        .await
        .expect("半关闭写方向");
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&ctx, &mut buf).await.expect("EOF"), 0);
    assert!(!server.is_ok());

    client
        .shutdown(&ctx, ShutdownDirection::Both)
        .await
        .expect("重复关闭不应报错");
}

/// 强制中断让阻塞在读上的任务立即返回，且之后流不可再用。
#[tokio::test(flavor = "multi_thread")]
async fn interrupt_unblocks_reader() {
    let (_client, mut server) = connected_pair().await;
    let ctx = IoContext::new();
    let handle = ctx.interrupt_handle().clone();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        let result = server.read(&ctx, &mut buf).await;
        (result.map(|_| ()), server.is_ok())
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.interrupt();

    let (result, still_ok) = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("中断后读任务必须及时结束")
        .expect("读任务不应 panic");
    assert!(result.expect_err("中断必须以错误返回").is_interrupted());
    assert!(!still_ok);
}
