//! # packet：扇出消息的共享封装
//!
//! ## 角色定位（Why）
//! - 一次 `send` 会把同一条消息交给多个输出单元，消息对象必须存活到最后一个单元写完；
//! - 以“槽位下标 + 代数”的句柄代替指针，过期句柄在访问时即被识别，不会误触已回收的槽位。
//!
//! ## 契约（What）
//! - `acquire` 时在途计数为 1（代表发送方自身），每交给一个单元再 `inc` 一次；
//! - 计数归零的那次 `complete` 回收槽位、代数加一，并在锁外调用 `on_completion`；
//! - 所有计数增减都在同一把互斥锁内完成。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{PortError, Result};
use crate::io::PortWriter;

/// 指向一个槽位的句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketHandle {
    index: u32,
    generation: u32,
}

impl PacketHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    generation: u32,
    in_flight: usize,
    content: Option<Arc<dyn PortWriter>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: usize,
}

impl Arena {
    fn slot_mut(&mut self, handle: PacketHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.content.is_some() => Ok(slot),
            _ => Err(PortError::StalePacket {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }
}

/// 一个端口的全部数据包。
#[derive(Default)]
pub struct PortCorePackets {
    arena: Mutex<Arena>,
    idle: Notify,
}

impl std::fmt::Debug for PortCorePackets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("PortCorePackets")
            .field("slots", &arena.slots.len())
            .field("active", &arena.active)
            .finish()
    }
}

impl PortCorePackets {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条新消息，在途计数为 1。
    pub fn acquire(&self, content: Arc<dyn PortWriter>) -> PacketHandle {
        content.on_commencement();
        let mut arena = self.arena.lock();
        arena.active += 1;
        if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.in_flight = 1;
            slot.content = Some(content);
            return PacketHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = arena.slots.len() as u32;
        arena.slots.push(Slot {
            generation: 0,
            in_flight: 1,
            content: Some(content),
        });
        PacketHandle {
            index,
            generation: 0,
        }
    }

    /// 又有一个单元持有该消息。
    pub fn inc(&self, handle: PacketHandle) -> Result<usize> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(handle)?;
        slot.in_flight += 1;
        Ok(slot.in_flight)
    }

    /// 一个持有者完成；返回 `true` 表示槽位已回收。
    pub fn complete(&self, handle: PacketHandle) -> Result<bool> {
        let (content, now_idle) = {
            let mut arena = self.arena.lock();
            let slot = arena.slot_mut(handle)?;
            slot.in_flight -= 1;
            if slot.in_flight > 0 {
                return Ok(false);
            }
            let content = slot.content.take();
            slot.generation = slot.generation.wrapping_add(1);
            arena.free.push(handle.index);
            arena.active -= 1;
            (content, arena.active == 0)
        };
        if let Some(content) = content {
            content.on_completion();
        }
        if now_idle {
            self.idle.notify_waiters();
        }
        Ok(true)
    }

    pub fn in_flight(&self, handle: PacketHandle) -> Result<usize> {
        let mut arena = self.arena.lock();
        Ok(arena.slot_mut(handle)?.in_flight)
    }

    /// 尚未回收的消息数。
    pub fn active_count(&self) -> usize {
        self.arena.lock().active
    }

    /// 等待所有消息回收。
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 单个持有者的计数份额，丢弃时自动 `complete`。
///
/// 输出单元无论写成、失败还是在关闭时丢弃排队的任务，份额都恰好归还一次。
#[derive(Debug)]
pub(crate) struct PacketLease {
    packets: Arc<PortCorePackets>,
    handle: PacketHandle,
}

impl PacketLease {
    /// 为 `handle` 再登记一个持有者。
    pub(crate) fn share(packets: &Arc<PortCorePackets>, handle: PacketHandle) -> Result<Self> {
        packets.inc(handle)?;
        Ok(Self {
            packets: Arc::clone(packets),
            handle,
        })
    }

    /// 接管 `acquire` 时发送方自带的那一份。
    pub(crate) fn adopt(packets: &Arc<PortCorePackets>, handle: PacketHandle) -> Self {
        Self {
            packets: Arc::clone(packets),
            handle,
        }
    }
}

impl Drop for PacketLease {
    fn drop(&mut self) {
        if let Err(err) = self.packets.complete(self.handle) {
            tracing::warn!(code = err.code(), "packet lease completed twice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ConnectionWriter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counted {
        completions: AtomicUsize,
    }

    impl PortWriter for Counted {
        fn write(&self, _writer: &mut ConnectionWriter) -> Result<()> {
            Ok(())
        }

        fn on_completion(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn slot_is_recycled_only_after_last_holder() {
        let packets = Arc::new(PortCorePackets::new());
        let message = Arc::new(Counted::default());
        let handle = packets.acquire(message.clone());
        let first = PacketLease::share(&packets, handle).expect("登记持有者");
        let second = PacketLease::share(&packets, handle).expect("登记持有者");
        assert_eq!(packets.in_flight(handle).expect("句柄有效"), 3);

        drop(PacketLease::adopt(&packets, handle));
        drop(first);
        assert_eq!(message.completions.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(message.completions.load(Ordering::SeqCst), 1);
        assert_eq!(packets.active_count(), 0);

        assert!(matches!(
            packets.inc(handle),
            Err(PortError::StalePacket { .. })
        ));
        let reused = packets.acquire(message.clone());
        assert_eq!(reused.index(), handle.index());
        assert_ne!(reused.generation(), handle.generation());
        assert!(packets.complete(handle).is_err());
        assert!(packets.complete(reused).expect("新句柄有效"));
    }
}
