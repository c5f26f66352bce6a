//! # core：一个命名端口的连接集合
//!
//! ## 角色定位（Why）
//! - [`PortCore`] 持有端口的全部输入/输出单元，是连接、断开、关闭与收发的唯一入口；
//! - 结构性修改（增删单元）在一把粗粒度锁下完成，单元上的阻塞 IO 从不持锁，
//!   一条慢连接不会拖住其它连接的增删。
//!
//! ## 行为契约（What）
//! - 单个单元的 IO 失败只剪除该连接，不影响端口；
//! - `add_output` 失败不会留下半成品单元；
//! - `send` 对输出列表做快照后并发扇出，`wait_after` 决定是否等待全部写完；
//! - 被判定为关闭中的单元不再出现在计数与路由列表中，结束后在下一次整理时回收。

mod admin;
mod delivery;
mod report;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use spark_transport::{InterruptHandle, IoContext, TwoWayStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

pub use delivery::Delivery;
pub use report::{PortInfo, PortReport};

use crate::bottle::{Bottle, Value};
use crate::command::PortCommand;
use crate::config::PortConfig;
use crate::contact::{ANY, Contact, Route, split_carrier};
use crate::error::{PortError, Result};
use crate::face::{Face, TcpFace, tcp_connect};
use crate::io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter, SizedMessage};
use crate::network::{ADMIN_SOURCE, Network};
use crate::packet::{PacketLease, PortCorePackets};
use crate::protocol::Protocol;
use crate::unit::{InputUnit, OutputRequest, OutputUnit, SendStatus, UnitKind, UnitShared};

/// 一次 `send` 的阻塞策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// 请求接收方回复；回复只取第一个送达的连接。
    pub want_reply: bool,
    /// 连接忙时是否等待；为 `false` 时忙碌的连接跳过本消息。
    pub wait_before: bool,
    /// 是否等待所有连接写完。
    pub wait_after: bool,
}

impl SendOptions {
    pub fn from_config(config: &PortConfig) -> Self {
        Self {
            want_reply: config.flags.rpc,
            wait_before: config.wait_before_send,
            wait_after: config.wait_after_send,
        }
    }

    pub fn with_reply(mut self) -> Self {
        self.want_reply = true;
        self
    }
}

/// 一次 `send` 的扇出结果。
#[derive(Debug, Default)]
pub struct SendReport {
    pub targets: usize,
    pub delivered: usize,
    pub queued: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reply: Option<ConnectionReader>,
}

#[derive(Clone, Debug)]
enum UnitEntry {
    Input(InputUnit),
    Output(OutputUnit),
}

impl UnitEntry {
    fn shared(&self) -> &Arc<UnitShared> {
        match self {
            UnitEntry::Input(unit) => unit.shared(),
            UnitEntry::Output(unit) => unit.shared(),
        }
    }

    async fn close(&self) {
        match self {
            UnitEntry::Input(unit) => unit.close().await,
            UnitEntry::Output(unit) => unit.close().await,
        }
    }
}

struct Listening {
    face: Arc<dyn Face>,
    task: JoinHandle<()>,
}

struct CoreInner {
    name: String,
    network: Network,
    config: PortConfig,
    contact: Contact,
    units: Mutex<Vec<UnitEntry>>,
    next_unit_id: AtomicU64,
    packets: Arc<PortCorePackets>,
    inbox_tx: Mutex<Option<mpsc::Sender<Delivery>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    handler: Mutex<Option<Box<dyn PortReader>>>,
    envelope: ArcSwap<String>,
    last_envelope: ArcSwap<String>,
    props: Mutex<BTreeMap<String, Value>>,
    interrupted: AtomicBool,
    closing: AtomicBool,
    wake: Notify,
    listener: Mutex<Option<Listening>>,
    reporter: Mutex<Option<Arc<dyn PortReport>>>,
    events: AtomicU64,
}

/// 命名端口的连接中枢。
///
/// # 教案式注释
/// - **意图 (Why)**：端口拥有者只面对“写一条消息”“读一条消息”，
///   连接的建立、协商、失效剪除都在这里收敛；
/// - **逻辑 (How)**：
///   - 监听任务接受原始流，每条流在独立任务中握手，成功后才登记为输入单元；
///   - 输出单元与输入单元各自拥有工作任务，核心只持有句柄；
///   - 单元列表由一把 `parking_lot::Mutex` 保护，所有 `.await` 都在锁外；
/// - **契约 (What)**：克隆共享同一端口；`close()` 可重复调用。
#[derive(Clone)]
pub struct PortCore {
    inner: Arc<CoreInner>,
}

/// 单元回指端口的弱引用；端口释放后单元自然停止投递。
#[derive(Clone, Debug, Default)]
pub struct WeakPortCore {
    inner: Weak<CoreInner>,
}

impl WeakPortCore {
    pub fn upgrade(&self) -> Option<PortCore> {
        self.inner.upgrade().map(|inner| PortCore { inner })
    }

    /// 不指向任何端口。
    pub fn detached() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for PortCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCore")
            .field("name", &self.inner.name)
            .field("contact", &self.inner.contact)
            .field("units", &self.inner.units.lock().len())
            .finish()
    }
}

/// 端口名补齐前导 `/`。
pub(crate) fn normalize_name(name: &str) -> String {
    format!("/{}", name.trim().trim_start_matches('/'))
}

impl PortCore {
    /// 打开端口：监听临时端口、登记名字、启动接受循环。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：校验配置 → 在 `config.host` 上监听端口 `0` → 向名字服务登记；
    ///   登记失败（重名）时监听器随之释放，不留下半开的端口；
    /// - **契约 (What)**：名字为空返回 [`PortError::Config`]，重名返回 [`PortError::NameInUse`]。
    pub async fn open(network: Network, name: &str, config: PortConfig) -> Result<Self> {
        config.validate()?;
        if name.trim().trim_start_matches('/').is_empty() {
            return Err(PortError::Config {
                detail: "port name must not be empty".to_owned(),
            });
        }
        let name = normalize_name(name);
        let face: Arc<dyn Face> = Arc::new(TcpFace::listen(&config.host, 0).await?);
        let contact = network.names().register_name(&name, face.local_contact())?;
        let (inbox_tx, inbox_rx) = mpsc::channel(config.input_queue);

        let inner = Arc::new(CoreInner {
            name,
            network,
            config,
            contact,
            units: Mutex::new(Vec::new()),
            next_unit_id: AtomicU64::new(1),
            packets: Arc::new(PortCorePackets::new()),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            handler: Mutex::new(None),
            envelope: ArcSwap::from_pointee(String::new()),
            last_envelope: ArcSwap::from_pointee(String::new()),
            props: Mutex::new(BTreeMap::new()),
            interrupted: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            wake: Notify::new(),
            listener: Mutex::new(None),
            reporter: Mutex::new(None),
            events: AtomicU64::new(0),
        });
        let core = PortCore { inner };
        let task = tokio::spawn(accept_loop(Arc::clone(&face), core.downgrade()));
        *core.inner.listener.lock() = Some(Listening { face, task });
        tracing::info!(port = %core.inner.name, contact = %core.inner.contact, "port listening");
        Ok(core)
    }

    pub fn downgrade(&self) -> WeakPortCore {
        WeakPortCore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn contact(&self) -> &Contact {
        &self.inner.contact
    }

    pub fn config(&self) -> &PortConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    pub fn packets(&self) -> &Arc<PortCorePackets> {
        &self.inner.packets
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_unit_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            return Err(PortError::Closed {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    async fn accept_incoming(&self, stream: Box<dyn TwoWayStream>) {
        let ctx = IoContext::new().with_timeout(self.inner.config.timeout());
        let mut protocol = Protocol::new(stream, ctx);
        match protocol
            .accept(self.inner.network.carriers(), &self.inner.name)
            .await
        {
            Ok(()) => {
                protocol.set_timeout(None);
                self.add_input(protocol).await;
            }
            Err(err) => {
                tracing::warn!(
                    port = %self.inner.name,
                    code = err.code(),
                    error = %err,
                    "incoming connection rejected"
                );
                protocol.close().await;
            }
        }
    }

    /// 登记一条握手完成的输入连接。
    ///
    /// 来源是具名端口时，同一来源到本端口的旧连接先被关闭；管理连接不受影响。
    async fn add_input(&self, protocol: Protocol) {
        let route = protocol.route().clone();
        let stale_pattern = Route::new(route.from(), route.to(), ANY);
        let replaces = route.from().starts_with('/');
        let admitted: std::result::Result<Vec<UnitEntry>, Protocol> = {
            let mut units = self.inner.units.lock();
            if self.is_closing() {
                Err(protocol)
            } else {
                let stale: Vec<UnitEntry> = units
                    .iter()
                    .filter(|entry| {
                        replaces
                            && entry.shared().kind() == UnitKind::Input
                            && entry.shared().is_running()
                            && stale_pattern.matches(&entry.shared().route())
                    })
                    .cloned()
                    .collect();
                for entry in &stale {
                    entry.shared().begin_closing();
                }
                let shared = UnitShared::new(self.next_id(), UnitKind::Input, route.clone());
                self.reap_when_finished(Arc::clone(&shared));
                let unit = InputUnit::spawn(protocol, shared, self.downgrade());
                units.push(UnitEntry::Input(unit));
                Ok(stale)
            }
        };
        match admitted {
            Err(mut protocol) => {
                tracing::debug!(route = %route, "port closing; incoming connection dropped");
                protocol.close().await;
            }
            Ok(stale) => {
                for entry in stale {
                    tracing::debug!(route = %entry.shared().route(), "replacing older input from the same source");
                    entry.close().await;
                }
                if route.from() != ADMIN_SOURCE {
                    tracing::info!(
                        port = %self.inner.name,
                        route = %route,
                        "Receiving input from {} to {} using {}",
                        route.from(),
                        route.to(),
                        route.carrier()
                    );
                    self.report(PortInfo::added(true, &route));
                }
            }
        }
    }

    /// 输入连接收到 `r` 后转为本端口的输出连接。
    pub(crate) async fn adopt_reversed(&self, mut protocol: Protocol) {
        let route = protocol.route().swap();
        protocol.set_route(route.clone());
        let refusal = if !self.inner.config.flags.output {
            Some("outputs are not allowed")
        } else if self.inner.config.flags.rpc && self.output_count() > 0 {
            Some("rpc port already has an output")
        } else {
            None
        };
        if let Some(reason) = refusal {
            tracing::warn!(route = %route, reason, "reversed connection refused");
            protocol.close().await;
            return;
        }
        let rejected = {
            let mut units = self.inner.units.lock();
            if self.is_closing() {
                Some(protocol)
            } else {
                let shared = UnitShared::new(self.next_id(), UnitKind::Output, route.clone());
                self.reap_when_finished(Arc::clone(&shared));
                let unit = OutputUnit::spawn(protocol, shared, self.inner.config.close_grace());
                units.push(UnitEntry::Output(unit));
                None
            }
        };
        match rejected {
            Some(mut protocol) => protocol.close().await,
            None => {
                tracing::info!(
                    port = %self.inner.name,
                    route = %route,
                    "Sending output from {} to {} using {}",
                    route.from(),
                    route.to(),
                    route.carrier()
                );
                self.report(PortInfo::added(false, &route));
            }
        }
    }

    /// 建立到 `target` 的输出连接，返回人类可读的结果说明。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：
    ///   1. 端口标志检查；解析 `carrier:/name` 前缀并查询名字；
    ///   2. Carrier 优先级：显式参数 > 目标前缀 > 配置的默认 Carrier；
    ///   3. 关闭已有的同目标连接，再检查 RPC 端口的单输出限制；
    ///   4. 建连与握手在锁外完成，成功后才登记单元；
    /// - **契约 (What)**：任何一步失败都不会留下半成品单元，已有的其它连接不受影响。
    pub async fn add_output(&self, target: &str, carrier: Option<&str>) -> Result<String> {
        self.ensure_open()?;
        let inner = &self.inner;
        if !inner.config.flags.output {
            return Err(PortError::NotAllowed {
                detail: format!("Outputs are not allowed from {}", inner.name),
            });
        }
        let (prefix, destination) = split_carrier(target);
        let contact = inner
            .network
            .names()
            .query_name(&destination)
            .filter(Contact::is_valid)
            .ok_or_else(|| PortError::NameNotFound {
                name: destination.clone(),
            })?;
        let carrier = carrier
            .filter(|name| !name.is_empty())
            .or(prefix)
            .unwrap_or(inner.config.default_carrier.as_str())
            .to_owned();

        self.remove_unit(
            &Route::new(ANY, destination.as_str(), ANY),
            Some(UnitKind::Output),
            true,
        )
        .await;
        if inner.config.flags.rpc && self.output_count() > 0 {
            return Err(PortError::NotAllowed {
                detail: format!("{} is an rpc port and already has an output", inner.name),
            });
        }

        let ctx = IoContext::new().with_timeout(inner.config.timeout());
        let stream = tcp_connect(&contact, &ctx).await?;
        let mut protocol = Protocol::new(stream, ctx);
        let route = Route::new(inner.name.as_str(), destination.as_str(), carrier);
        if let Err(err) = protocol.open(inner.network.carriers(), route).await {
            protocol.close().await;
            tracing::warn!(
                port = %inner.name,
                target = %destination,
                code = err.code(),
                error = %err,
                "outgoing handshake failed"
            );
            return Err(match err {
                err @ PortError::UnknownCarrier { .. } => err,
                other => PortError::ConnectionRefused {
                    target: destination,
                    detail: other.to_string(),
                },
            });
        }
        protocol.set_timeout(None);
        let route = protocol.route().clone();

        let rejected = {
            let mut units = inner.units.lock();
            if self.is_closing() {
                Some(protocol)
            } else {
                let shared = UnitShared::new(self.next_id(), UnitKind::Output, route.clone());
                self.reap_when_finished(Arc::clone(&shared));
                let unit = OutputUnit::spawn(protocol, shared, inner.config.close_grace());
                units.push(UnitEntry::Output(unit));
                None
            }
        };
        if let Some(mut protocol) = rejected {
            protocol.close().await;
            return Err(PortError::Closed {
                name: inner.name.clone(),
            });
        }
        let message = format!("Added connection from {} to {}", inner.name, destination);
        tracing::info!(port = %inner.name, route = %route, "{message}");
        self.report(PortInfo::added(false, &route));
        Ok(message)
    }

    /// 连接到 `source` 并请求对方把这条连接当作它的输出（`r` 命令）。
    ///
    /// 用于本端口无法被对方主动连接、只能由本端拨出的场合。
    pub async fn add_reversed_input(&self, source: &str, carrier: Option<&str>) -> Result<String> {
        self.ensure_open()?;
        let inner = &self.inner;
        let (prefix, source) = split_carrier(source);
        let contact = inner
            .network
            .names()
            .query_name(&source)
            .filter(Contact::is_valid)
            .ok_or_else(|| PortError::NameNotFound {
                name: source.clone(),
            })?;
        let carrier = carrier
            .filter(|name| !name.is_empty())
            .or(prefix)
            .unwrap_or(inner.config.default_carrier.as_str())
            .to_owned();
        let ctx = IoContext::new().with_timeout(inner.config.timeout());
        let stream = tcp_connect(&contact, &ctx).await?;
        let mut protocol = Protocol::new(stream, ctx);
        let route = Route::new(inner.name.as_str(), source.as_str(), carrier);
        let opened = match protocol.open(inner.network.carriers(), route).await {
            Ok(()) if protocol.flags().can_escape => {
                let flags = protocol.flags();
                let mut command = ConnectionWriter::new(flags.text_mode);
                PortCommand::reverse().write(&mut command);
                let message = SizedMessage::assemble(
                    Some(command),
                    ConnectionWriter::new(flags.text_mode),
                    false,
                );
                protocol.write(&message, false).await.map(|_| ())
            }
            Ok(()) => Err(PortError::NotAllowed {
                detail: format!(
                    "carrier {} cannot reverse a connection",
                    protocol.carrier_name().unwrap_or_default()
                ),
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = opened {
            protocol.close().await;
            return Err(match err {
                err @ (PortError::UnknownCarrier { .. } | PortError::NotAllowed { .. }) => err,
                other => PortError::ConnectionRefused {
                    target: source,
                    detail: other.to_string(),
                },
            });
        }
        protocol.set_timeout(None);
        let route = protocol.route().swap();
        protocol.set_route(route);
        self.add_input(protocol).await;
        Ok(format!("Receiving input from {} to {}", source, inner.name))
    }

    pub async fn remove_output(&self, target: &str) -> Result<String> {
        self.remove_output_with(target, true).await
    }

    pub async fn remove_input(&self, source: &str) -> Result<String> {
        self.remove_input_with(source, true).await
    }

    pub(crate) async fn remove_output_with(&self, target: &str, wait: bool) -> Result<String> {
        let (_, destination) = split_carrier(target);
        let removed = self
            .remove_unit(
                &Route::new(ANY, destination.as_str(), ANY),
                Some(UnitKind::Output),
                wait,
            )
            .await;
        if removed == 0 {
            return Err(PortError::NotConnected {
                detail: format!("Could not find an outgoing connection to {destination}"),
            });
        }
        let message = format!("Removed connection from {} to {}", self.inner.name, destination);
        tracing::info!(port = %self.inner.name, "{message}");
        Ok(message)
    }

    pub(crate) async fn remove_input_with(&self, source: &str, wait: bool) -> Result<String> {
        let (_, source) = split_carrier(source);
        let removed = self
            .remove_unit(
                &Route::new(source.as_str(), ANY, ANY),
                Some(UnitKind::Input),
                wait,
            )
            .await;
        if removed == 0 {
            return Err(PortError::NotConnected {
                detail: format!("Could not find an incoming connection from {source}"),
            });
        }
        let message = format!("Removed connection from {} to {}", source, self.inner.name);
        tracing::info!(port = %self.inner.name, "{message}");
        Ok(message)
    }

    /// 关闭所有匹配 `pattern` 的运行中单元，返回数量。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：锁内把匹配单元标记为关闭中并取出句柄，锁外逐个 `close()`；
    ///   `wait = false` 时关闭在后台进行，单元结束后由整理过程回收；
    /// - **契约 (What)**：正在写出的单元不会被提前移出列表，只有已结束的单元才会被回收。
    pub async fn remove_unit(&self, pattern: &Route, kind: Option<UnitKind>, wait: bool) -> usize {
        let doomed: Vec<UnitEntry> = {
            let units = self.inner.units.lock();
            units
                .iter()
                .filter(|entry| {
                    let shared = entry.shared();
                    kind.is_none_or(|kind| shared.kind() == kind)
                        && shared.is_running()
                        && pattern.matches(&shared.route())
                })
                .cloned()
                .collect()
        };
        for entry in &doomed {
            entry.shared().begin_closing();
        }
        if wait {
            join_all(doomed.iter().map(UnitEntry::close)).await;
            self.clean_units();
        } else {
            for entry in doomed.iter().cloned() {
                tokio::spawn(async move { entry.close().await });
            }
        }
        doomed.len()
    }

    /// 单元结束后立即整理一次，移除事件不必等到下一次查询。
    fn reap_when_finished(&self, shared: Arc<UnitShared>) {
        let core = self.downgrade();
        tokio::spawn(async move {
            shared.wait_finished().await;
            if let Some(core) = core.upgrade() {
                core.clean_units();
            }
        });
    }

    /// 回收已结束的单元。
    fn clean_units(&self) {
        let pruned: Vec<Arc<UnitShared>> = {
            let mut units = self.inner.units.lock();
            let mut pruned = Vec::new();
            units.retain(|entry| {
                let finished = entry.shared().is_finished();
                if finished {
                    pruned.push(Arc::clone(entry.shared()));
                }
                !finished
            });
            pruned
        };
        for shared in pruned {
            tracing::info!(
                port = %self.inner.name,
                route = %shared.route(),
                kind = ?shared.kind(),
                "pruned finished connection"
            );
            let route = shared.route();
            let incoming = shared.kind() == UnitKind::Input;
            if !(incoming && route.from() == ADMIN_SOURCE) {
                self.report(PortInfo::removed(incoming, &route));
            }
        }
    }

    /// 设置连接事件的接收者，替换之前的接收者。
    pub fn set_report_callback(&self, reporter: Arc<dyn PortReport>) {
        *self.inner.reporter.lock() = Some(reporter);
    }

    pub fn reset_report_callback(&self) {
        self.inner.reporter.lock().take();
    }

    fn report(&self, info: PortInfo) {
        let reporter = self.inner.reporter.lock().clone();
        if let Some(reporter) = reporter {
            reporter.report(&info);
        }
    }

    /// 是否有消息仍在某个输出连接上写出。
    pub fn is_writing(&self) -> bool {
        self.inner.packets.active_count() > 0
    }

    /// 接受循环已接收的入站连接数（含握手失败与管理连接）。
    pub fn event_count(&self) -> u64 {
        self.inner.events.load(Ordering::Relaxed)
    }

    fn live_routes(&self, kind: UnitKind) -> Vec<Route> {
        self.clean_units();
        self.inner
            .units
            .lock()
            .iter()
            .map(UnitEntry::shared)
            .filter(|shared| shared.kind() == kind && shared.is_running())
            .map(|shared| shared.route())
            .collect()
    }

    /// 运行中的输出连接路由。
    pub fn output_routes(&self) -> Vec<Route> {
        self.live_routes(UnitKind::Output)
    }

    /// 运行中的输入连接路由（不含管理连接）。
    pub fn input_routes(&self) -> Vec<Route> {
        self.live_routes(UnitKind::Input)
            .into_iter()
            .filter(|route| route.from() != ADMIN_SOURCE)
            .collect()
    }

    pub fn output_count(&self) -> usize {
        self.output_routes().len()
    }

    pub fn input_count(&self) -> usize {
        self.input_routes().len()
    }

    /// 把一条消息写给所有输出连接。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：多接收方广播时，一个失效的接收方不能让整次写入失败；
    /// - **逻辑 (How)**：
    ///   1. 整理单元并对运行中的输出连接做快照；
    ///   2. 在 [`PortCorePackets`] 登记消息，发送方持有一份计数，每个连接再各持一份；
    ///   3. 并发调用各单元的 `send`，汇总为 [`SendReport`]；第一个回复被保留；
    /// - **契约 (What)**：
    ///   - 端口中断返回 [`PortError::Interrupted`]，关闭返回 [`PortError::Closed`]；
    ///   - 连接级失败只计入 `failed`，不作为错误返回；
    ///   - 没有输出连接时返回全零报告，消息的完成回调立即触发。
    pub async fn send(&self, content: Arc<dyn PortWriter>, options: SendOptions) -> Result<SendReport> {
        self.ensure_open()?;
        let inner = &self.inner;
        if self.is_interrupted() {
            return Err(PortError::Interrupted {
                port: inner.name.clone(),
            });
        }
        self.clean_units();
        let outputs: Vec<OutputUnit> = inner
            .units
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                UnitEntry::Output(unit) if unit.shared().is_running() => Some(unit.clone()),
                _ => None,
            })
            .collect();

        let envelope: Arc<str> = Arc::from(inner.envelope.load().as_str());
        let handle = inner.packets.acquire(Arc::clone(&content));
        let own_share = PacketLease::adopt(&inner.packets, handle);
        let mut sends = Vec::with_capacity(outputs.len());
        for unit in &outputs {
            let request = OutputRequest {
                content: Arc::clone(&content),
                envelope: Arc::clone(&envelope),
                want_reply: options.want_reply,
                lease: PacketLease::share(&inner.packets, handle)?,
            };
            sends.push(unit.send(request, options.wait_before, options.wait_after));
        }
        drop(own_share);

        let mut report = SendReport {
            targets: outputs.len(),
            ..SendReport::default()
        };
        for status in join_all(sends).await {
            match status {
                SendStatus::Delivered { reply } => {
                    report.delivered += 1;
                    if report.reply.is_none() {
                        report.reply = reply;
                    }
                }
                SendStatus::Queued => report.queued += 1,
                SendStatus::Skipped => report.skipped += 1,
                SendStatus::Failed => report.failed += 1,
            }
        }
        tracing::debug!(
            port = %inner.name,
            targets = report.targets,
            delivered = report.delivered,
            queued = report.queued,
            skipped = report.skipped,
            failed = report.failed,
            "message sent"
        );
        Ok(report)
    }

    /// 输入单元把一条数据消息交给端口拥有者，返回要回复给发送方的内容。
    ///
    /// 设置了读处理器时同步调用处理器；否则进入投递队列，队列满时输入单元在此等待。
    pub(crate) async fn deliver(
        &self,
        mut reader: ConnectionReader,
        want_reply: bool,
        interrupt: &InterruptHandle,
    ) -> Option<ConnectionWriter> {
        let inner = &self.inner;
        inner
            .last_envelope
            .store(Arc::new(reader.envelope().to_owned()));
        if !inner.config.flags.input {
            tracing::debug!(port = %inner.name, route = %reader.route(), "input disabled; message dropped");
            return None;
        }

        {
            let mut handler = inner.handler.lock();
            if let Some(handler) = handler.as_mut() {
                if want_reply {
                    reader.enable_reply();
                }
                if let Err(err) = handler.read(&mut reader) {
                    tracing::warn!(
                        port = %inner.name,
                        code = err.code(),
                        error = %err,
                        "read handler rejected message"
                    );
                }
                return reader.take_reply();
            }
        }

        let sender = inner.inbox_tx.lock().clone()?;
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let delivery = Delivery::new(reader, reply_tx);
        tokio::select! {
            biased;
            _ = interrupt.interrupted() => return None,
            sent = sender.send(delivery) => {
                if sent.is_err() {
                    return None;
                }
            }
        }
        drop(sender);
        let reply_rx = reply_rx?;
        tokio::select! {
            biased;
            _ = interrupt.interrupted() => None,
            reply = reply_rx => reply.ok(),
        }
    }

    /// 读取下一条入站消息。
    ///
    /// `blocking = false` 时没有消息立即返回 `None`，另一任务正阻塞读取时亦然；
    /// 端口中断或关闭时同样返回 `None`。
    pub async fn read(&self, blocking: bool) -> Option<Delivery> {
        if !blocking {
            let mut inbox = self.inner.inbox_rx.try_lock().ok()?;
            return inbox.try_recv().ok();
        }
        let mut inbox = self.inner.inbox_rx.lock().await;
        loop {
            let woken = self.inner.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            if self.is_interrupted() {
                return None;
            }
            tokio::select! {
                delivery = inbox.recv() => return delivery,
                _ = &mut woken => continue,
            }
        }
    }

    /// 以回调方式接收消息；设置后消息不再进入投递队列。
    pub fn set_read_handler(&self, handler: Box<dyn PortReader>) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// 恢复队列方式接收。
    pub fn clear_read_handler(&self) {
        self.inner.handler.lock().take();
    }

    /// 设置随后续消息发送的信封；在第一个控制字符处截断。
    pub fn set_envelope(&self, envelope: &str) {
        let end = envelope
            .find(|ch: char| ch.is_control())
            .unwrap_or(envelope.len());
        self.inner
            .envelope
            .store(Arc::new(envelope[..end].to_owned()));
    }

    pub fn envelope(&self) -> String {
        self.inner.envelope.load().as_ref().clone()
    }

    /// 最近一条入站消息携带的信封。
    pub fn last_envelope(&self) -> String {
        self.inner.last_envelope.load().as_ref().clone()
    }

    pub(crate) fn property(&self, key: &str) -> Option<Value> {
        self.inner.props.lock().get(key).cloned()
    }

    pub(crate) fn set_property(&self, key: &str, value: Value) {
        self.inner.props.lock().insert(key.to_owned(), value);
    }

    pub(crate) fn properties(&self) -> Bottle {
        let mut bottle = Bottle::new();
        for (key, value) in self.inner.props.lock().iter() {
            bottle.add_pair(key, value.clone());
        }
        bottle
    }

    /// 中断端口：等待中的读取立即返回，新的写入被拒绝，直到 `resume()`。
    pub fn interrupt(&self) {
        if !self.inner.interrupted.swap(true, Ordering::AcqRel) {
            tracing::debug!(port = %self.inner.name, "port interrupted");
        }
        self.inner.wake.notify_waiters();
    }

    pub fn resume(&self) {
        if self.inner.interrupted.swap(false, Ordering::AcqRel) {
            tracing::debug!(port = %self.inner.name, "port resumed");
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// 人类可读的端口描述。
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "This is {} at {}",
            self.inner.name, self.inner.contact
        )];
        let outputs = self.output_routes();
        if outputs.is_empty() {
            lines.push("There are no outgoing connections".to_owned());
        }
        for route in outputs {
            lines.push(format!(
                "There is an output connection from {} to {} using {}",
                route.from(),
                route.to(),
                route.carrier()
            ));
        }
        let inputs = self.input_routes();
        if inputs.is_empty() {
            lines.push("There are no incoming connections".to_owned());
        }
        for route in inputs {
            lines.push(format!(
                "There is an input connection from {} to {} using {}",
                route.from(),
                route.to(),
                route.carrier()
            ));
        }
        lines
    }

    /// 关闭端口。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：
    ///   1. 置关闭标志并停止监听，等待接受循环退出；
    ///   2. 请求向本端口写入的远端端口删除它们的输出连接（带宽限期，尽力而为）；
    ///   3. 关闭全部单元并等待结束，注销名字，关闭投递队列；
    /// - **契约 (What)**：可重复调用；之后的 `send` 返回 [`PortError::Closed`]，`read` 返回 `None`。
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        let listening = inner.listener.lock().take();
        if let Some(listening) = listening {
            listening.face.close();
            if let Err(err) = listening.task.await {
                tracing::debug!(port = %inner.name, error = %err, "accept loop ended abnormally");
            }
        }

        let writers: Vec<String> = self
            .live_routes(UnitKind::Input)
            .into_iter()
            .map(|route| route.from().to_owned())
            .filter(|from| from.starts_with('/') && *from != inner.name)
            .collect();
        let grace = inner.config.close_grace();
        join_all(writers.iter().map(|writer| async move {
            let mut request = Bottle::new();
            request.add_vocab("del").push(inner.name.as_str());
            match tokio::time::timeout(grace, inner.network.admin(writer, &request)).await {
                Ok(Ok(_)) => tracing::debug!(port = %inner.name, writer = %writer, "asked writer to disconnect"),
                Ok(Err(err)) => tracing::debug!(port = %inner.name, writer = %writer, code = err.code(), "writer not reachable"),
                Err(_) => tracing::debug!(port = %inner.name, writer = %writer, "writer did not answer in time"),
            }
        }))
        .await;

        self.remove_unit(&Route::any(), None, true).await;
        self.clean_units();
        if let Err(err) = inner.network.names().unregister_name(&inner.name) {
            tracing::warn!(port = %inner.name, code = err.code(), "name could not be unregistered");
        }
        inner.inbox_tx.lock().take();
        inner.wake.notify_waiters();
        tracing::info!(port = %inner.name, "port closed");
    }
}

async fn accept_loop(face: Arc<dyn Face>, core: WeakPortCore) {
    loop {
        let stream = match face.accept().await {
            Ok(stream) => stream,
            Err(err) if err.is_interrupted() => break,
            Err(err) => {
                tracing::warn!(code = err.code(), error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(core) = core.upgrade() else {
            break;
        };
        if core.is_closing() {
            break;
        }
        core.inner.events.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move { core.accept_incoming(stream).await });
    }
    tracing::debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    async fn open(network: &Network, name: &str) -> PortCore {
        PortCore::open(network.clone(), name, PortConfig::default())
            .await
            .expect("端口打开成功")
    }

    #[test]
    fn names_are_rooted() {
        assert_eq!(normalize_name("r"), "/r");
        assert_eq!(normalize_name("/r"), "/r");
        assert_eq!(normalize_name("//a/b"), "/a/b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn envelope_stops_at_control_characters() {
        let network = Network::local();
        let port = open(&network, "/env").await;
        port.set_envelope("stamp 42\nignored");
        assert_eq!(port.envelope(), "stamp 42");
        port.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_blocking_read_returns_while_another_reader_waits() {
        let network = Network::local();
        let port = open(&network, "/polled").await;
        let waiting = {
            let port = port.clone();
            tokio::spawn(async move { port.read(true).await.is_some() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let polled = tokio::time::timeout(std::time::Duration::from_secs(1), port.read(false))
            .await
            .expect("非阻塞读取不应等待");
        assert!(polled.is_none());
        waiting.abort();
        port.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writing_lasts_until_every_packet_completes() {
        let network = Network::local();
        let port = open(&network, "/busy").await;
        assert!(!port.is_writing());
        let handle = port.packets().acquire(Arc::new(Bottle::new()));
        assert!(port.is_writing());
        assert!(port.packets().complete(handle).expect("句柄有效"));
        assert!(!port.is_writing());
        port.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_names_are_refused() {
        let network = Network::local();
        let first = open(&network, "/dup").await;
        let second = PortCore::open(network.clone(), "dup", PortConfig::default()).await;
        assert!(matches!(second, Err(PortError::NameInUse { .. })));
        first.close().await;
        let again = open(&network, "/dup").await;
        again.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn failed_outputs_are_pruned_and_logged() {
        let network = Network::local();
        let writer = open(&network, "/prune/w").await;
        let reader = open(&network, "/prune/r").await;
        writer
            .add_output("/prune/r", None)
            .await
            .expect("连接建立");
        assert_eq!(writer.output_count(), 1);

        reader.close().await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let _ = writer
                .send(Arc::new(Bottle::from_text("1 2 3").expect("文本")), SendOptions::from_config(writer.config()))
                .await;
            if writer.output_count() == 0 && writer.inner.units.lock().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "失效连接应被回收");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(logs_contain("pruned finished connection"));
        writer.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_port_rejects_sends_until_resumed() {
        let network = Network::local();
        let port = open(&network, "/pause").await;
        port.interrupt();
        let refused = port
            .send(Arc::new(Bottle::new()), SendOptions::from_config(port.config()))
            .await;
        assert!(matches!(refused, Err(PortError::Interrupted { .. })));
        assert!(port.read(true).await.is_none());
        port.resume();
        let report = port
            .send(Arc::new(Bottle::new()), SendOptions::from_config(port.config()))
            .await
            .expect("恢复后可写");
        assert_eq!(report.targets, 0);
        port.close().await;
        assert!(matches!(
            port.send(Arc::new(Bottle::new()), SendOptions::from_config(port.config()))
                .await,
            Err(PortError::Closed { .. })
        ));
    }
}
