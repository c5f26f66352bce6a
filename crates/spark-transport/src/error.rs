use std::borrow::Cow;
use std::io;

use thiserror::Error;

const INTERRUPTED_CODE: &str = "spark.transport.interrupted";
const TIMEOUT_CODE: &str = "spark.transport.timeout";
const CLOSED_CODE: &str = "spark.transport.closed";

/// 传输错误的粗粒度分类，决定上层是丢弃连接还是允许调用方重试。
///
/// # 教案式注释
/// - **意图（Why）**：单元遇到任何传输错误都会结束自身，但调用方（例如 `connect`）
///   需要区分“对端不可达，可以稍后重试”与“配置错误，重试无意义”。
/// - **契约（What）**：`Interrupted` 只由 [`InterruptHandle`](crate::InterruptHandle)
///   触发；`Closed` 表示对端正常关闭（读到 EOF）或流已被替换。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 超过配置的单次 IO 超时。
    Timeout,
    /// 本地强制中断了流。
    Interrupted,
    /// 可能是暂时性错误，例如连接被拒绝或重置。
    Retryable,
    /// 不可恢复的错误。
    NonRetryable,
    /// 流已关闭。
    Closed,
}

/// 一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    /// 在常量上下文中声明操作种类。
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }

    /// 把 IO 错误映射为带分类的传输错误。
    pub fn io_error(self, error: io::Error) -> TransportError {
        let category = categorize_io_error(&error);
        TransportError::new(self.code, format!("{}: {}", self.message, error))
            .with_category(category)
            .with_source(error)
    }

    /// 操作被强制中断。
    pub fn interrupted(self) -> TransportError {
        TransportError::new(INTERRUPTED_CODE, format!("{} interrupted", self.message))
            .with_category(ErrorCategory::Interrupted)
    }

    /// 操作超时。
    pub fn timed_out(self) -> TransportError {
        TransportError::new(TIMEOUT_CODE, format!("{} timed out", self.message))
            .with_category(ErrorCategory::Timeout)
    }

    /// 对端已关闭或流已不可用。
    pub fn closed(self) -> TransportError {
        TransportError::new(CLOSED_CODE, format!("{}: stream closed", self.message))
            .with_category(ErrorCategory::Closed)
    }
}

/// 传输层错误：稳定错误码 + 人类可读文案 + 分类 + 可选的底层 IO 错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端口核心在扇出路径上只记录并丢弃失败连接，日志需要可检索的错误码；
/// - 握手失败需要向 `connect` 调用方返回明确原因，文案中保留操作名称与 IO 细节。
///
/// ## 契约（What）
/// - `code()` 形如 `spark.transport.tcp.read_failed`，跨版本保持稳定；
/// - `category()` 见 [`ErrorCategory`]；
/// - `source()` 在由 IO 错误转换而来时返回原始 `io::Error`。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct TransportError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    #[source]
    source: Option<io::Error>,
}

impl TransportError {
    /// 以默认分类 `NonRetryable` 构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::NonRetryable,
            source: None,
        }
    }

    /// 覆盖错误分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 附带底层 IO 错误。
    pub fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 是否由强制中断引起。
    pub fn is_interrupted(&self) -> bool {
        self.category == ErrorCategory::Interrupted
    }

    /// 是否表示流已关闭（对端挂断或本地替换）。
    pub fn is_closed(&self) -> bool {
        self.category == ErrorCategory::Closed
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::UnexpectedEof => ErrorCategory::Closed,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}
