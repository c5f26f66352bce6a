//! # unit：每条连接一个工作任务
//!
//! ## 角色定位（Why）
//! - 输出单元独占一条连接的写方向，保证同一时刻至多一条消息在途，从而保证单连接内的顺序；
//! - 输入单元独占读方向，把消息分派给端口或管理命令处理逻辑；
//! - 单元的 IO 失败只终结自己，由 PortCore 在下一次整理时回收。
//!
//! ## 生命周期（What）
//! - `Starting → Running → Closing → Finished`；`Closing` 可从 `Starting` 直接进入；
//! - `close()` 可重复调用，也可在单元因对端挂断而自行结束后调用，均不报错。

mod input;
mod output;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

pub use input::InputUnit;
pub use output::{OutputUnit, SendStatus};
pub(crate) use output::OutputRequest;

use crate::contact::Route;

/// 单元状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnitState {
    Starting = 0,
    Running = 1,
    Closing = 2,
    Finished = 3,
}

impl UnitState {
    pub fn can_transition_to(self, target: UnitState) -> bool {
        matches!(
            (self, target),
            (UnitState::Starting, UnitState::Running)
                | (UnitState::Starting, UnitState::Closing)
                | (UnitState::Running, UnitState::Closing)
                | (UnitState::Closing, UnitState::Finished)
                | (UnitState::Running, UnitState::Finished)
                | (UnitState::Starting, UnitState::Finished)
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => UnitState::Starting,
            1 => UnitState::Running,
            2 => UnitState::Closing,
            _ => UnitState::Finished,
        }
    }
}

/// 连接方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Input,
    Output,
}

/// 单元与 PortCore 之间共享的状态。
#[derive(Debug)]
pub struct UnitShared {
    id: u64,
    kind: UnitKind,
    route: Route,
    state: AtomicU8,
    finished: watch::Sender<bool>,
}

impl UnitShared {
    pub(crate) fn new(id: u64, kind: UnitKind, route: Route) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id,
            kind,
            route,
            state: AtomicU8::new(UnitState::Starting as u8),
            finished,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn route(&self) -> Route {
        self.route.clone()
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 按状态图推进；非法跃迁返回 `false` 且不修改状态。
    pub(crate) fn transition(&self, target: UnitState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                UnitState::from_u8(raw)
                    .can_transition_to(target)
                    .then_some(target as u8)
            })
            .is_ok()
    }

    /// 正常运行中（未进入关闭流程）。
    pub fn is_running(&self) -> bool {
        self.state() <= UnitState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == UnitState::Finished
    }

    /// 标记进入关闭流程；已在关闭或已结束时返回 `false`。
    pub(crate) fn begin_closing(&self) -> bool {
        self.transition(UnitState::Closing)
    }

    pub(crate) fn finish(&self) {
        self.state
            .store(UnitState::Finished as u8, Ordering::Release);
        self.finished.send_replace(true);
    }

    /// 等待单元结束。
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // 发送端与 self 同寿，`wait_for` 只会在状态为 true 时返回。
        let _ = rx.wait_for(|finished| *finished).await;
    }
}

/// 工作任务退出（包括 panic 展开）时把单元标记为结束。
pub(crate) struct FinishGuard(pub(crate) Arc<UnitShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_graph_and_idempotent_closing() {
        let shared = UnitShared::new(1, UnitKind::Output, Route::any());
        assert!(shared.transition(UnitState::Running));
        assert!(shared.is_running());
        assert!(shared.begin_closing());
        assert!(!shared.begin_closing());
        assert!(!shared.transition(UnitState::Running));
        shared.finish();
        assert!(shared.is_finished());
        assert!(!shared.begin_closing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiting_observes_finish_from_another_task() {
        let shared = UnitShared::new(2, UnitKind::Input, Route::any());
        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            let _guard = FinishGuard(worker);
        });
        tokio::time::timeout(std::time::Duration::from_secs(5), shared.wait_finished())
            .await
            .expect("单元应在超时前结束");
    }

    use std::time::Duration;

    use spark_transport::{IoContext, MemoryStream};

    use crate::bottle::Bottle;
    use crate::carrier::CarrierRegistry;
    use crate::core::WeakPortCore;
    use crate::packet::{PacketLease, PortCorePackets};
    use crate::protocol::Protocol;

    async fn handshaken_pair() -> (Protocol, Protocol) {
        let registry = CarrierRegistry::with_defaults();
        let (left, right) = MemoryStream::pair(64 * 1024);
        let mut sender = Protocol::new(Box::new(left), IoContext::new());
        let mut receiver = Protocol::new(Box::new(right), IoContext::new());
        let (opened, accepted) = tokio::join!(
            sender.open(&registry, Route::new("/w", "/r", "tcp")),
            receiver.accept(&registry, "/r"),
        );
        opened.expect("发送方握手");
        accepted.expect("接收方握手");
        (sender, receiver)
    }

    fn request(packets: &Arc<PortCorePackets>) -> OutputRequest {
        let content: Arc<dyn crate::io::PortWriter> =
            Arc::new(Bottle::from_text("1 2 3").expect("文本"));
        let handle = packets.acquire(Arc::clone(&content));
        OutputRequest {
            content,
            envelope: Arc::from(""),
            want_reply: false,
            lease: PacketLease::adopt(packets, handle),
        }
    }

    /// 重复关闭、对端挂断后再关闭都不报错，流只关闭一次。
    #[tokio::test(flavor = "multi_thread")]
    async fn closing_twice_or_after_hangup_is_quiet() {
        let (sender, receiver) = handshaken_pair().await;
        let route = Route::new("/w", "/r", "tcp");
        let output = OutputUnit::spawn(
            sender,
            UnitShared::new(1, UnitKind::Output, route.clone()),
            Duration::from_millis(500),
        );
        let input = InputUnit::spawn(
            receiver,
            UnitShared::new(2, UnitKind::Input, route),
            WeakPortCore::detached(),
        );

        let packets = Arc::new(PortCorePackets::new());
        let status = output.send(request(&packets), true, true).await;
        assert!(matches!(status, SendStatus::Delivered { reply: None }));
        assert_eq!(packets.active_count(), 0);

        output.close().await;
        output.close().await;
        assert!(output.shared().is_finished());

        tokio::time::timeout(Duration::from_secs(5), input.shared().wait_finished())
            .await
            .expect("收到 q 后输入单元自行结束");
        input.close().await;
        input.close().await;
        assert!(input.shared().is_finished());
    }

    /// 接收方被强制关闭后，发送失败只体现为 `Failed`，数据包份额仍然归还。
    #[tokio::test(flavor = "multi_thread")]
    async fn send_after_peer_interrupt_fails_quietly() {
        let (sender, receiver) = handshaken_pair().await;
        let route = Route::new("/w", "/r", "tcp");
        let output = OutputUnit::spawn(
            sender,
            UnitShared::new(3, UnitKind::Output, route.clone()),
            Duration::from_millis(200),
        );
        let input = InputUnit::spawn(
            receiver,
            UnitShared::new(4, UnitKind::Input, route),
            WeakPortCore::detached(),
        );
        input.close().await;
        assert!(input.shared().is_finished());

        let packets = Arc::new(PortCorePackets::new());
        let status = output.send(request(&packets), true, true).await;
        assert!(matches!(status, SendStatus::Failed));
        assert_eq!(packets.active_count(), 0);

        output.shared().wait_finished().await;
        output.close().await;
        assert!(matches!(
            output.send(request(&packets), true, true).await,
            SendStatus::Failed
        ));
        assert_eq!(packets.active_count(), 0);
    }
}
