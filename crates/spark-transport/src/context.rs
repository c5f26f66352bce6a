use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{OperationKind, TransportError};

/// 强制关闭一条流的句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 单元的服务任务常常阻塞在 `read` 上，`close()`/`interrupt()` 必须能让它立刻返回；
/// - 这里不是协作式取消令牌：一旦触发，绑定该句柄的流视为已被强制关闭，此后所有 IO 都失败。
///
/// ## 逻辑（How）
/// - 原子位记录是否已中断，`Notify` 唤醒正在等待的 IO；
/// - 等待方先 `enable` 通知再检查原子位，避免“先通知后等待”的丢失唤醒。
///
/// ## 契约（What）
/// - `interrupt` 首次触发返回 `true`，重复调用返回 `false` 且无副作用；
/// - 克隆共享同一状态。
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    flag: AtomicBool,
    notify: Notify,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已触发中断。
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 触发中断并唤醒所有等待中的 IO。
    pub fn interrupt(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待直到中断被触发。
    pub async fn interrupted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

/// 单条连接上 IO 操作共享的上下文：中断句柄 + 单次操作超时。
#[derive(Clone, Debug, Default)]
pub struct IoContext {
    interrupt: InterruptHandle,
    timeout: Option<Duration>,
}

impl IoContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置单次 IO 的超时；`None` 表示无限等待。
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 绑定外部创建的中断句柄。
    pub fn with_interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }
}

/// 在中断与超时语义下执行一次 IO Future。
///
/// # 教案式注释
/// - **逻辑（How）**：先检查是否已中断；随后以 `biased` 的 `select!` 让中断优先于超时、
///   超时优先于 IO 结果，保证 `close()` 之后不会再有字节被视为成功写出。
/// - **契约（What）**：IO 错误经 [`OperationKind::io_error`] 映射，保留稳定错误码。
pub async fn run_with_context<F, T>(
    ctx: &IoContext,
    kind: OperationKind,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    if ctx.is_interrupted() {
        return Err(kind.interrupted());
    }

    let interrupted = ctx.interrupt.interrupted();
    tokio::pin!(interrupted);
    tokio::pin!(future);

    match ctx.timeout {
        Some(timeout) => {
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                _ = &mut interrupted => Err(kind.interrupted()),
                _ = &mut sleep => Err(kind.timed_out()),
                result = &mut future => result.map_err(|err| kind.io_error(err)),
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = &mut interrupted => Err(kind.interrupted()),
                result = &mut future => result.map_err(|err| kind.io_error(err)),
            }
        }
    }
}
