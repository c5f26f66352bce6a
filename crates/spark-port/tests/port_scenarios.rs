//! 端口之间的端到端场景：连接、写入、故障隔离、非法头、单连接内不交错。

use std::sync::Arc;
use std::time::Duration;

use spark_port::{Bottle, Network, Port, PortConfig, SendOptions, Value};
use spark_transport::{IoContext, TwoWayStream};
use spark_transport_tcp::TcpChannel;

async fn open(network: &Network, name: &str) -> Port {
    Port::open(network, name).await.expect("端口打开成功")
}

async fn read_bottle(port: &Port) -> Bottle {
    let mut bottle = Bottle::new();
    tokio::time::timeout(Duration::from_secs(5), port.read_into(&mut bottle))
        .await
        .expect("应在超时前收到消息")
        .expect("消息可解析")
        .expect("端口未关闭");
    bottle
}

/// 场景 A：`/w → /r` 经 tcp 写入 `(1 2 3)`，接收方原样读出。
#[tokio::test(flavor = "multi_thread")]
async fn bottle_travels_from_writer_to_reader() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;

    let message = writer.connect("/r").await.expect("连接建立");
    assert_eq!(message, "Added connection from /w to /r");
    assert_eq!(writer.output_count(), 1);

    let report = writer
        .write(Bottle::from_text("1 2 3").expect("文本"))
        .await
        .expect("写入");
    assert_eq!(report.targets, 1);
    assert_eq!(report.delivered, 1);

    let bottle = read_bottle(&reader).await;
    assert_eq!(bottle.get(0).and_then(Value::as_int), Some(1));
    assert_eq!(bottle.get(1).and_then(Value::as_int), Some(2));
    assert_eq!(bottle.get(2).and_then(Value::as_int), Some(3));
    assert_eq!(reader.input_count(), 1);
    assert_eq!(reader.core().input_routes()[0].from(), "/w");

    writer.close().await;
    reader.close().await;
}

/// 场景 B：两个接收方中的一个断开底层流，写入仍送达另一个，失效连接从输出列表消失。
#[tokio::test(flavor = "multi_thread")]
async fn one_dead_receiver_does_not_stop_the_others() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let first = open(&network, "/r1").await;
    let second = open(&network, "/r2").await;
    writer.connect("/r1").await.expect("连接 /r1");
    writer.connect("/r2").await.expect("连接 /r2");
    assert_eq!(writer.output_count(), 2);

    first.disconnect_input("/w").await.expect("断开 /r1 的输入");

    let report = writer
        .write(Bottle::from_text("after failure").expect("文本"))
        .await
        .expect("广播写入不因单个连接失败而报错");
    assert_eq!(report.targets, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);

    let bottle = read_bottle(&second).await;
    assert_eq!(bottle.get(0).and_then(Value::as_word).as_deref(), Some("after"));
    let routes = writer.core().output_routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].to(), "/r2");

    for port in [&writer, &first, &second] {
        port.close().await;
    }
}

/// 场景 C：不被识别的 8 字节头得到说明文字，且不会登记输入单元。
#[tokio::test(flavor = "multi_thread")]
async fn garbage_header_is_rejected_without_a_unit() {
    let network = Network::local();
    let reader = open(&network, "/r").await;
    let ctx = IoContext::new().with_timeout(Some(Duration::from_secs(5)));
    let addr = reader.contact().socket_addr().expect("可连接地址");
    let mut raw = TcpChannel::connect(&ctx, addr).await.expect("建立 TCP 连接");
    raw.write_all(&ctx, &[0x13, 0x37, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01])
        .await
        .expect("写入垃圾头");
    raw.flush(&ctx).await.expect("刷新");

    let mut answer = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = raw.read(&ctx, &mut buf).await.expect("读取说明文字");
        if n == 0 {
            break;
        }
        answer.extend_from_slice(&buf[..n]);
    }
    let answer = String::from_utf8_lossy(&answer);
    assert!(answer.starts_with("* Error. Protocol not found."), "{answer}");
    assert_eq!(reader.input_count(), 0);
    reader.close().await;
}

/// 场景 D：两个并发写入共用一条连接，接收方看到的每条消息都完整且不交错。
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writes_never_interleave() {
    const SIZE: usize = 1 << 20;
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;
    writer.connect("/r").await.expect("连接建立");

    let (a, b) = tokio::join!(writer.write(vec![b'A'; SIZE]), writer.write(vec![b'B'; SIZE]));
    assert_eq!(a.expect("写入 A").delivered, 1);
    assert_eq!(b.expect("写入 B").delivered, 1);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let mut payload = Vec::<u8>::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_into(&mut payload))
            .await
            .expect("应在超时前收到消息")
            .expect("读取")
            .expect("端口未关闭");
        assert_eq!(payload.len(), SIZE);
        let first = payload[0];
        assert!(payload.iter().all(|byte| *byte == first), "消息内出现交错字节");
        seen.push(first);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![b'A', b'B']);

    writer.close().await;
    reader.close().await;
}

/// 连接忙且写入方不愿等待时，消息被跳过而不是排队。
#[tokio::test(flavor = "multi_thread")]
async fn busy_connection_skips_when_not_waiting() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let config = PortConfig {
        input_queue: 1,
        ..PortConfig::default()
    };
    let reader = Port::open_with(&network, "/r", config)
        .await
        .expect("端口打开成功");
    writer.connect("/r").await.expect("连接建立");

    let blocking = SendOptions {
        want_reply: false,
        wait_before: true,
        wait_after: true,
    };
    let first = writer
        .write_with(Arc::new(Bottle::from_text("1").expect("文本")), blocking)
        .await
        .expect("第一条写入");
    assert_eq!(first.delivered, 1);

    let queued = SendOptions {
        wait_after: false,
        ..blocking
    };
    let second = writer
        .write_with(Arc::new(Bottle::from_text("2").expect("文本")), queued)
        .await
        .expect("第二条写入");
    assert_eq!(second.queued, 1);

    let impatient = SendOptions {
        wait_before: false,
        ..queued
    };
    let third = writer
        .write_with(Arc::new(Bottle::from_text("3").expect("文本")), impatient)
        .await
        .expect("第三条写入");
    assert_eq!(third.skipped, 1);
    assert_eq!(third.delivered + third.queued, 0);

    for expected in [1, 2] {
        let bottle = read_bottle(&reader).await;
        assert_eq!(bottle.get(0).and_then(Value::as_int), Some(expected));
    }
    assert!(reader.try_read().await.is_none());

    writer.close().await;
    reader.close().await;
}
