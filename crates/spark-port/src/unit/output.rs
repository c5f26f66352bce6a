use std::sync::Arc;
use std::time::Duration;

use spark_transport::InterruptHandle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};

use super::{FinishGuard, UnitShared, UnitState};
use crate::carrier::CarrierFlags;
use crate::command::PortCommand;
use crate::contact::Route;
use crate::io::{ConnectionReader, ConnectionWriter, PortWriter, SizedMessage};
use crate::packet::PacketLease;
use crate::protocol::Protocol;

/// 单个输出连接上一次发送的结果。
#[derive(Debug)]
pub enum SendStatus {
    /// 已写出（以及确认）；请求回复时携带回复。
    Delivered { reply: Option<ConnectionReader> },
    /// 已排队，调用方未等待写出。
    Queued,
    /// 连接忙且调用方不愿等待，消息被跳过。
    Skipped,
    /// 连接已失效，消息未送达。
    Failed,
}

/// 交给输出单元的一条消息。
pub(crate) struct OutputRequest {
    pub(crate) content: Arc<dyn PortWriter>,
    pub(crate) envelope: Arc<str>,
    pub(crate) want_reply: bool,
    pub(crate) lease: PacketLease,
}

struct OutputJob {
    request: OutputRequest,
    permit: OwnedSemaphorePermit,
    done: Option<oneshot::Sender<SendStatus>>,
}

/// 一个输出连接。
///
/// # 教案式注释
/// - **意图 (Why)**：同一连接上不允许两条消息交错，否则接收方无法切分；
/// - **逻辑 (How)**：工作任务独占 [`Protocol`]，从容量为 1 的队列取任务顺序写出；
///   发送方入队前必须拿到单许可信号量，许可随任务一起移交，写完才归还，
///   因此任意时刻至多一条消息在途；
/// - **契约 (What)**：
///   - `wait_before = false` 且连接忙时返回 [`SendStatus::Skipped`]；
///   - `wait_after = true` 或请求回复时等待写出完成；
///   - IO 失败只终结本单元，结果以 [`SendStatus::Failed`] 报告，不向写入方抛错；
///   - `close()` 先发送 `q` 命令优雅断开，宽限期过后强制中断。
#[derive(Clone)]
pub struct OutputUnit {
    shared: Arc<UnitShared>,
    jobs: mpsc::Sender<OutputJob>,
    gate: Arc<Semaphore>,
    quit: Arc<Notify>,
    interrupt: InterruptHandle,
    flags: CarrierFlags,
    grace: Duration,
}

impl std::fmt::Debug for OutputUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputUnit")
            .field("id", &self.shared.id())
            .field("route", &self.shared.route())
            .field("state", &self.shared.state())
            .finish()
    }
}

impl OutputUnit {
    /// 接管握手完成的连接并启动工作任务。
    pub(crate) fn spawn(protocol: Protocol, shared: Arc<UnitShared>, grace: Duration) -> Self {
        let (jobs, queue) = mpsc::channel(1);
        let gate = Arc::new(Semaphore::new(1));
        let quit = Arc::new(Notify::new());
        let unit = Self {
            shared: Arc::clone(&shared),
            jobs,
            gate: Arc::clone(&gate),
            quit: Arc::clone(&quit),
            interrupt: protocol.interrupt_handle(),
            flags: protocol.flags(),
            grace,
        };
        shared.transition(UnitState::Running);
        tokio::spawn(run(protocol, queue, shared, gate, quit));
        unit
    }

    pub fn shared(&self) -> &Arc<UnitShared> {
        &self.shared
    }

    pub fn route(&self) -> Route {
        self.shared.route()
    }

    pub fn flags(&self) -> CarrierFlags {
        self.flags
    }

    /// 是否有消息在途。
    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }

    pub(crate) async fn send(
        &self,
        request: OutputRequest,
        wait_before: bool,
        wait_after: bool,
    ) -> SendStatus {
        if !self.shared.is_running() {
            return SendStatus::Failed;
        }
        let permit = if wait_before {
            match Arc::clone(&self.gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return SendStatus::Failed,
            }
        } else {
            match Arc::clone(&self.gate).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return SendStatus::Skipped,
                Err(TryAcquireError::Closed) => return SendStatus::Failed,
            }
        };
        let (done, outcome) = if wait_after || request.want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let job = OutputJob {
            request,
            permit,
            done,
        };
        if self.jobs.send(job).await.is_err() {
            return SendStatus::Failed;
        }
        match outcome {
            None => SendStatus::Queued,
            Some(rx) => rx.await.unwrap_or(SendStatus::Failed),
        }
    }

    /// 优雅关闭；可重复调用。
    pub async fn close(&self) {
        self.shared.begin_closing();
        self.quit.notify_one();
        if tokio::time::timeout(self.grace, self.shared.wait_finished())
            .await
            .is_err()
        {
            tracing::debug!(route = %self.shared.route(), "output close grace expired, interrupting");
            self.interrupt.interrupt();
            self.shared.wait_finished().await;
        }
    }

    /// 立即中断连接。
    pub fn interrupt(&self) {
        self.shared.begin_closing();
        self.interrupt.interrupt();
    }
}

async fn run(
    mut protocol: Protocol,
    mut queue: mpsc::Receiver<OutputJob>,
    shared: Arc<UnitShared>,
    gate: Arc<Semaphore>,
    quit: Arc<Notify>,
) {
    let _finish = FinishGuard(Arc::clone(&shared));
    tracing::debug!(route = %shared.route(), "output unit started");
    let mut healthy = true;
    loop {
        tokio::select! {
            biased;
            _ = quit.notified() => break,
            job = queue.recv() => match job {
                Some(job) => {
                    if !deliver(&mut protocol, job, &shared, &gate).await {
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    shared.begin_closing();
    gate.close();
    queue.close();
    while let Ok(job) = queue.try_recv() {
        drop(job);
    }
    if healthy && protocol.is_ok() && protocol.flags().can_escape {
        let text_mode = protocol.flags().text_mode;
        let mut command = ConnectionWriter::new(text_mode);
        PortCommand::quit().write(&mut command);
        let message =
            SizedMessage::assemble(Some(command), ConnectionWriter::new(text_mode), false);
        if let Err(err) = protocol.write(&message, false).await {
            tracing::debug!(code = err.code(), "quit command not delivered");
        }
    }
    protocol.close().await;
    tracing::debug!(route = %shared.route(), "output unit stopped");
}

/// 写出一个任务；返回 `false` 表示连接已失效。
async fn deliver(
    protocol: &mut Protocol,
    job: OutputJob,
    shared: &UnitShared,
    gate: &Semaphore,
) -> bool {
    let OutputJob {
        request,
        permit,
        done,
    } = job;
    let respond = |status: SendStatus| {
        if let Some(done) = done {
            let _ = done.send(status);
        }
    };
    let flags = protocol.flags();

    let mut body = ConnectionWriter::new(flags.text_mode);
    let serialised = request
        .content
        .write(&mut body)
        .and_then(|()| body.ensure_single_line());
    if let Err(err) = serialised {
        tracing::warn!(route = %shared.route(), code = err.code(), error = %err, "message could not be serialised");
        drop(request.lease);
        drop(permit);
        respond(SendStatus::Failed);
        return true;
    }
    let want_reply = request.want_reply && flags.supports_reply;
    let command = flags.can_escape.then(|| {
        let mut command = ConnectionWriter::new(flags.text_mode);
        PortCommand::data(&request.envelope, want_reply).write(&mut command);
        command
    });
    let message = SizedMessage::assemble(command, body, want_reply);

    match protocol.write(&message, want_reply).await {
        Ok(reply) => {
            let route = protocol.route().clone();
            let reply =
                reply.map(|bytes| ConnectionReader::new(bytes, flags.text_mode).with_route(route));
            drop(request.lease);
            drop(permit);
            respond(SendStatus::Delivered { reply });
            true
        }
        Err(err) => {
            shared.begin_closing();
            gate.close();
            if err.is_interrupted() {
                tracing::debug!(route = %shared.route(), "output interrupted mid-send");
            } else {
                tracing::warn!(
                    route = %shared.route(),
                    code = err.code(),
                    error = %err,
                    "output connection failed; dropping it"
                );
            }
            drop(request.lease);
            drop(permit);
            respond(SendStatus::Failed);
            false
        }
    }
}
