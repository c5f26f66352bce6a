//! 全局日志初始化；独立成一个测试二进制，避免与 `#[traced_test]` 争夺全局 Subscriber。

use spark_port::logging::init_tracing;

#[test]
fn tracing_is_installed_once() {
    assert!(init_tracing("spark_port=debug"), "首次调用安装 Subscriber");
    assert!(!init_tracing("spark_port=trace"), "再次调用不做修改");
    tracing::info!(port = "/log", "subscriber active");
}
