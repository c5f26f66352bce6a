//! 管理命令、各 Carrier、RPC 回复、反向连接、信封与读处理器。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_port::protocol::ConnectionState;
use spark_port::{
    Bottle, ConnectionReader, Network, Port, PortConfig, PortError, PortFlags, PortInfo,
    PortReader, PortWriter, Value,
};
use spark_transport::IoContext;
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

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "条件未在超时前成立");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn words(bottle: &Bottle) -> Vec<String> {
    bottle.iter().filter_map(Value::as_word).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_vocabulary() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;

    let mut ver = Bottle::new();
    ver.add_vocab("ver");
    let reply = network.admin("/r", &ver).await.expect("ver 回复");
    assert_eq!(reply.get(0).and_then(Value::as_word).as_deref(), Some("ver"));
    assert_eq!(reply.get(1).and_then(Value::as_int), Some(1));
    assert_eq!(reply.get(3).and_then(Value::as_int), Some(3));

    let help = network
        .admin("/r", &Bottle::from_text("help").expect("文本"))
        .await
        .expect("help 回复");
    assert_eq!(help.get(0).and_then(Value::as_word).as_deref(), Some("many"));
    assert!(help.len() > 5);

    let added = network.connect("/w", "/r", None).await.expect("远程建立连接");
    assert_eq!(added, "Added connection from /w to /r");
    assert_eq!(writer.output_count(), 1);
    assert_eq!(writer.input_count(), 0, "管理连接不计入输入");

    let outs = network
        .admin("/w", &Bottle::from_text("list out").expect("文本"))
        .await
        .expect("list out 回复");
    assert_eq!(words(&outs), vec!["/r".to_owned()]);
    let detail = network
        .admin("/w", &Bottle::from_text("list out /r").expect("文本"))
        .await
        .expect("list out /r 回复");
    assert_eq!(detail.find("from").and_then(Value::as_word).as_deref(), Some("/w"));
    assert_eq!(detail.find("carrier").and_then(Value::as_word).as_deref(), Some("tcp"));
    eventually(|| reader.input_count() == 1).await;
    let ins = network
        .admin("/r", &Bottle::from_text("list in").expect("文本"))
        .await
        .expect("list in 回复");
    assert_eq!(words(&ins), vec!["/w".to_owned()]);

    network
        .admin("/r", &Bottle::from_text("prop set rate 30").expect("文本"))
        .await
        .expect("prop set");
    let rate = network
        .admin("/r", &Bottle::from_text("prop get rate").expect("文本"))
        .await
        .expect("prop get");
    assert_eq!(rate.get(0).and_then(Value::as_int), Some(30));

    let unknown = network
        .admin("/r", &Bottle::from_text("dance").expect("文本"))
        .await
        .expect("未知命令也有回复");
    assert_eq!(unknown.get(0).and_then(Value::as_word).as_deref(), Some("fail"));

    network.disconnect("/w", "/r").await.expect("远程断开");
    assert_eq!(writer.output_count(), 0);
    let missing = network.disconnect("/w", "/r").await;
    assert!(matches!(missing, Err(PortError::ConnectionRefused { .. })));

    writer.close().await;
    reader.close().await;
}

/// 除默认 tcp 之外的 Carrier 都能承载同一条 Bottle。
#[tokio::test(flavor = "multi_thread")]
async fn every_carrier_delivers_a_bottle() {
    let network = Network::local();
    for carrier in ["fast_tcp", "text", "text_ack", "udp"] {
        let writer = open(&network, "/w").await;
        let reader = open(&network, "/r").await;
        writer
            .connect_with("/r", carrier)
            .await
            .unwrap_or_else(|err| panic!("{carrier} 连接失败: {err}"));
        assert_eq!(writer.core().output_routes()[0].carrier(), carrier);

        let report = writer
            .write(Bottle::from_text("7 \"seven\" 7.5").expect("文本"))
            .await
            .expect("写入");
        assert_eq!(report.delivered, 1, "{carrier}");
        let bottle = read_bottle(&reader).await;
        assert_eq!(bottle.get(0).and_then(Value::as_int), Some(7), "{carrier}");
        assert_eq!(bottle.get(1).and_then(Value::as_str), Some("seven"), "{carrier}");
        assert_eq!(bottle.get(2).and_then(Value::as_f64), Some(7.5), "{carrier}");

        writer.close().await;
        reader.close().await;
    }
}

/// 行协议上多行字符串整体送达；无法转义的多行原始字节被拒绝，连接保持可用。
#[tokio::test(flavor = "multi_thread")]
async fn line_carriers_keep_multi_line_payloads_whole() {
    let network = Network::local();
    for carrier in ["text", "text_ack"] {
        let writer = open(&network, "/w").await;
        let reader = open(&network, "/r").await;
        writer.connect_with("/r", carrier).await.expect("连接");

        let report = writer
            .write(String::from("alpha\nbeta \\ end"))
            .await
            .expect("写入");
        assert_eq!(report.delivered, 1, "{carrier}");
        let mut text = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_into(&mut text))
            .await
            .expect("应在超时前收到消息")
            .expect("消息可解析");
        assert_eq!(text, "alpha\nbeta \\ end", "{carrier}");

        let rejected = writer
            .write(Bytes::from_static(b"one\ntwo"))
            .await
            .expect("写入");
        assert_eq!((rejected.delivered, rejected.failed), (0, 1), "{carrier}");
        assert_eq!(writer.output_count(), 1, "{carrier}: 连接不因拒绝而断开");

        let next = writer.write(String::from("gamma")).await.expect("写入");
        assert_eq!(next.delivered, 1, "{carrier}");
        tokio::time::timeout(Duration::from_secs(5), reader.read_into(&mut text))
            .await
            .expect("应在超时前收到消息")
            .expect("消息可解析");
        assert_eq!(text, "gamma", "{carrier}");

        writer.close().await;
        reader.close().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn carrier_prefix_selects_carrier() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;
    writer.connect("text_ack://r").await.expect("带前缀的连接");
    let routes = writer.core().output_routes();
    assert_eq!(routes[0].to(), "/r");
    assert_eq!(routes[0].carrier(), "text_ack");
    writer.close().await;
    reader.close().await;
}

/// 人类通过 telnet 式的文本会话与端口交互。
#[tokio::test(flavor = "multi_thread")]
async fn human_text_session() {
    let network = Network::local();
    let reader = open(&network, "/r").await;
    let ctx = IoContext::new().with_timeout(Some(Duration::from_secs(5)));
    let addr = reader.contact().socket_addr().expect("可连接地址");
    let channel = TcpChannel::connect(&ctx, addr).await.expect("建立 TCP 连接");
    let mut session = ConnectionState::new(Box::new(channel), ctx);

    session.write_all(b"CONNECT /human\r\n").await.expect("写入");
    session.flush().await.expect("刷新");
    assert_eq!(session.read_line().await.expect("欢迎语"), "Welcome /human");

    session.write_all(b"*\r\n").await.expect("写入");
    session.flush().await.expect("刷新");
    assert!(session.read_line().await.expect("描述").starts_with("This is /r at "));
    assert_eq!(
        session.read_line().await.expect("描述"),
        "There are no outgoing connections"
    );
    assert_eq!(
        session.read_line().await.expect("描述"),
        "There is an input connection from /human to /r using text"
    );

    session.write_all(b"x\r\n").await.expect("写入");
    session.flush().await.expect("刷新");
    assert_eq!(
        session.read_line().await.expect("提示"),
        "Port command not understood."
    );
    session.read_line().await.expect("提示");
    session.read_line().await.expect("提示");

    session.write_all(b"d\r\n4 5 6\r\n").await.expect("写入");
    session.flush().await.expect("刷新");
    let bottle = read_bottle(&reader).await;
    assert_eq!(bottle.get(2).and_then(Value::as_int), Some(6));

    session.write_all(b"q\r\n").await.expect("写入");
    session.flush().await.expect("刷新");
    let closed = session.read_line().await;
    assert!(closed.is_err(), "q 之后端口关闭连接");
    eventually(|| reader.input_count() == 0).await;
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_client_receives_reply() {
    let network = Network::local();
    let server = open(&network, "/srv").await;
    let client = Port::open_with(&network, "/cli", PortConfig::default().with_flags(PortFlags::rpc()))
        .await
        .expect("RPC 端口打开成功");
    client.connect("/srv").await.expect("连接建立");

    let serving = server.clone();
    let answer = tokio::spawn(async move {
        let mut delivery = serving.read().await.expect("收到请求");
        assert!(delivery.expects_reply());
        let mut request = Bottle::new();
        delivery.read_into(&mut request).expect("解析请求");
        let sum: i32 = request.iter().filter_map(Value::as_int).sum();
        let mut reply = Bottle::new();
        reply.push(sum);
        delivery.reply(&reply).expect("回复");
    });

    let mut reader = client
        .write_with_reply(Bottle::from_text("2 3 4").expect("文本"))
        .await
        .expect("收到回复");
    answer.await.expect("服务任务不应 panic");
    let mut reply = Bottle::new();
    reply.read(&mut reader).expect("解析回复");
    assert_eq!(reply.get(0).and_then(Value::as_int), Some(9));

    let second = open(&network, "/srv2").await;
    let refused = client.connect("/srv2").await;
    assert!(matches!(refused, Err(PortError::NotAllowed { .. })));
    assert_eq!(client.output_count(), 1);

    for port in [&client, &server, &second] {
        port.close().await;
    }
}

/// 读处理器同步处理消息并写回回复。
#[tokio::test(flavor = "multi_thread")]
async fn read_handler_answers_inline() {
    struct Doubler {
        seen: Arc<Mutex<Vec<i32>>>,
    }

    impl PortReader for Doubler {
        fn read(&mut self, reader: &mut ConnectionReader) -> spark_port::Result<()> {
            let mut request = Bottle::new();
            request.read(reader)?;
            let value = request.get(0).and_then(Value::as_int).unwrap_or_default();
            self.seen.lock().push(value);
            if let Some(reply) = reader.reply_writer() {
                let mut doubled = Bottle::new();
                doubled.push(value * 2);
                doubled.write(reply)?;
            }
            Ok(())
        }
    }

    let network = Network::local();
    let server = open(&network, "/double").await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    server.set_read_handler(Doubler {
        seen: Arc::clone(&seen),
    });
    let client = open(&network, "/ask").await;
    client.connect("/double").await.expect("连接建立");

    let mut reader = client
        .write_with_reply(Bottle::from_text("21").expect("文本"))
        .await
        .expect("收到回复");
    let mut reply = Bottle::new();
    reply.read(&mut reader).expect("解析回复");
    assert_eq!(reply.get(0).and_then(Value::as_int), Some(42));

    client
        .write(Bottle::from_text("5").expect("文本"))
        .await
        .expect("写入");
    assert_eq!(*seen.lock(), vec![21, 5]);
    assert!(server.try_read().await.is_none(), "处理器模式下消息不进入队列");

    client.close().await;
    server.close().await;
}

/// 本端拨出、对端写入：`r` 命令把连接方向反转。
#[tokio::test(flavor = "multi_thread")]
async fn reversed_connection_carries_data_back() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;

    let message = reader.connect_reversed("/w").await.expect("反向连接");
    assert_eq!(message, "Receiving input from /w to /r");
    eventually(|| writer.output_count() == 1).await;
    assert_eq!(writer.core().output_routes()[0].to(), "/r");
    assert_eq!(writer.input_count(), 0);
    assert_eq!(reader.input_count(), 1);

    writer
        .write(Bottle::from_text("back at you").expect("文本"))
        .await
        .expect("写入");
    let bottle = read_bottle(&reader).await;
    assert_eq!(bottle.get(1).and_then(Value::as_word).as_deref(), Some("at"));

    writer.close().await;
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn envelope_travels_with_messages() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;
    writer.connect("/r").await.expect("连接建立");
    writer.set_envelope("frame 12\r\njunk");

    writer
        .write(Bottle::from_text("1").expect("文本"))
        .await
        .expect("写入");
    let delivery = tokio::time::timeout(Duration::from_secs(5), reader.read())
        .await
        .expect("应在超时前收到消息")
        .expect("端口未关闭");
    assert_eq!(delivery.envelope(), "frame 12");
    assert_eq!(delivery.route().from(), "/w");
    assert_eq!(reader.last_envelope(), "frame 12");

    writer.close().await;
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_failures_are_reported() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let missing = writer.connect("/nobody").await;
    match missing {
        Err(err @ PortError::NameNotFound { .. }) => {
            assert_eq!(err.to_string(), "Do not know how to connect to /nobody");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let not_connected = writer.disconnect("/nobody").await;
    match not_connected {
        Err(err) => assert_eq!(
            err.to_string(),
            "Could not find an outgoing connection to /nobody"
        ),
        Ok(message) => panic!("unexpected success {message}"),
    }

    let input_only = Port::open_with(
        &network,
        "/sink",
        PortConfig::default().with_flags(PortFlags {
            input: true,
            output: false,
            rpc: false,
        }),
    )
    .await
    .expect("端口打开成功");
    assert!(matches!(
        input_only.connect("/w").await,
        Err(PortError::NotAllowed { .. })
    ));
    assert!(matches!(
        writer.connect("bogus://sink").await,
        Err(PortError::UnknownCarrier { .. })
    ));
    assert_eq!(writer.output_count(), 0);

    writer.close().await;
    input_only.close().await;
}

/// 关闭接收端口时，写入方被要求删除到它的输出连接。
#[tokio::test(flavor = "multi_thread")]
async fn closing_a_reader_detaches_its_writers() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;
    writer.connect("/r").await.expect("连接建立");
    reader.close().await;
    reader.close().await;

    eventually(|| writer.output_count() == 0).await;
    assert!(network.query("/r").is_none());
    assert!(reader.read().await.is_none());
    writer.close().await;
}

fn record_events(port: &Port) -> Arc<Mutex<Vec<PortInfo>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    port.set_report_callback(Arc::new(move |info: &PortInfo| sink.lock().push(info.clone())));
    events
}

fn messages(events: &Mutex<Vec<PortInfo>>) -> Vec<String> {
    events.lock().iter().map(|info| info.message.clone()).collect()
}

/// 连接的建立与移除以事件形式通知端口拥有者，管理连接不产生事件。
#[tokio::test(flavor = "multi_thread")]
async fn connection_events_reach_the_report_callback() {
    let network = Network::local();
    let writer = open(&network, "/w").await;
    let reader = open(&network, "/r").await;
    let written = record_events(&writer);
    let received = record_events(&reader);

    writer.connect("/r").await.expect("连接");
    assert_eq!(messages(&written), vec!["Sending output from /w to /r using tcp"]);
    let added = written.lock()[0].clone();
    assert!(added.created && !added.incoming);
    assert_eq!(added.route.to(), "/r");
    eventually(|| !received.lock().is_empty()).await;
    assert_eq!(messages(&received), vec!["Receiving input from /w to /r using tcp"]);
    assert!(received.lock()[0].incoming);

    network
        .admin("/r", &Bottle::from_text("ver").expect("文本"))
        .await
        .expect("ver 回复");
    assert!(reader.core().event_count() >= 2, "普通连接与管理连接都经过接受循环");

    writer.disconnect("/r").await.expect("断开");
    eventually(|| written.lock().len() == 2).await;
    assert_eq!(messages(&written)[1], "Removing output from /w to /r");
    assert!(!written.lock()[1].created);
    eventually(|| received.lock().len() == 2).await;
    assert_eq!(messages(&received)[1], "Removing input from /w to /r");

    writer.reset_report_callback();
    writer.connect("/r").await.expect("再次连接");
    assert_eq!(written.lock().len(), 2, "重置后不再通知");

    writer.close().await;
    reader.close().await;
}
