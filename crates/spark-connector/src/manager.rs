//! # 连接器管理器
//!
//! ## 核心意图（Why）
//! - 对传输层与业务层收敛为单一门面：下层以 `receive`/`register_channel`/
//!   `close` 递交连接事件，上层以 `write` 发报并注册监听器；
//! - 四类并发参与者（传输回调、派发工作任务、重试泵、存活清扫）共享注册表
//!   与重试队列，本模块负责让它们在不丢写、不重复关闭、不泄露重试表项的
//!   前提下协同。
//!
//! ## 生命周期（What）
//! - 状态机：未初始化，经 `init` 进入就绪，经 `start` 进入运行，经
//!   `shutdown` 收尾后回到就绪，允许再次 `start`；
//! - `destroyed` 标志是唯一的跨任务信号：`start` 置假、`shutdown` 置真，
//!   重试泵每轮查验，存活清扫以它消歧停止信号；
//! - 运行态之外调用 `register_channel`/`receive`/`close` 仅记警告并返回；
//!   `write` 的即时写出不受停机门控，但停机期间拒绝重试入队（既定行为，
//!   可靠报文在停机窗口内可能恰好投递一次而无补偿）。
//!
//! ## 并发纪律（How）
//! - 注册表与重试队列为并发映射，单键操作原子完成，无跨键复合不变量；
//! - 监听器列表写时复制，派发遍历的是注册瞬间的快照；
//! - 生命周期操作以异步互斥串行化，`start`/`shutdown` 不会交错执行。

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Channel, CloseCause};
use crate::config::ConnectorConfig;
use crate::datagram::{self, ProtocolData, TYPE_ACK, TYPE_HEARTBEAT, TYPE_INDEX};
use crate::dispatch::ReceiveDispatcher;
use crate::error::ConnectorError;
use crate::event::{
    ConnectorEvent, CustomEvent, EventBus, LoggingEventBus, ProtocolDataListener,
    ProtocolEventListener,
};
use crate::registry::{ChannelRegistry, RegisterOutcome};
use crate::retry::{self, RetryQueue};
use crate::sweep;

/// 管理器与后台任务共享的运行态。
///
/// # 教案式说明
/// - **意图 (Why)**：重试泵与存活清扫以 `Arc` 共享本结构，管理器门面只是
///   其上的一层编排；
/// - **契约 (What)**：除生命周期编排外的全部可变状态集中于此，每个字段
///   各自具备并发纪律，互相之间不构成复合不变量；
/// - **风险 (Trade-offs)**：`destroyed` 与注册表之间不做原子耦合，依赖
///   各路径的幂等与至多一次语义兜底。
pub(crate) struct ConnectorShared {
    config: RwLock<ConnectorConfig>,
    heartbeat_secs: AtomicU64,
    destroyed: AtomicBool,
    registry: ChannelRegistry,
    retries: RetryQueue,
    data_listeners: ArcSwap<Vec<Arc<dyn ProtocolDataListener>>>,
    event_listeners: ArcSwap<Vec<Arc<dyn ProtocolEventListener>>>,
    bus: RwLock<Arc<dyn EventBus>>,
    dispatcher: ArcSwapOption<ReceiveDispatcher>,
}

impl ConnectorShared {
    fn new() -> Self {
        let config = ConnectorConfig::default();
        Self {
            heartbeat_secs: AtomicU64::new(config.effective_heartbeat_secs()),
            config: RwLock::new(config),
            destroyed: AtomicBool::new(true),
            registry: ChannelRegistry::new(),
            retries: RetryQueue::new(),
            data_listeners: ArcSwap::from_pointee(Vec::new()),
            event_listeners: ArcSwap::from_pointee(Vec::new()),
            bus: RwLock::new(Arc::new(LoggingEventBus)),
            dispatcher: ArcSwapOption::empty(),
        }
    }

    /// 停机意图标志。真值表示管理器不处于运行态。
    pub(crate) fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub(crate) fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    /// 生效的心跳阈值（秒），`init` 阶段已完成下限钳制。
    pub(crate) fn heartbeat_secs(&self) -> u64 {
        self.heartbeat_secs.load(Ordering::Acquire)
    }

    pub(crate) fn sweep_period(&self) -> core::time::Duration {
        core::time::Duration::from_secs(self.heartbeat_secs() / 5)
    }

    /// 广播事件：先投递注入的总线，再通知协议事件监听器快照。
    ///
    /// - **契约 (What)**：观测面的任何失败（包括 panic）都被兜底吞掉，
    ///   绝不反向影响协议动作。
    pub(crate) fn publish(&self, event: ConnectorEvent) {
        let bus = self.bus.read().clone();
        if catch_unwind(AssertUnwindSafe(|| bus.broadcast(event.clone()))).is_err() {
            warn!(
                target: "spark_connector::manager",
                kind = event.name(),
                "event bus panicked during broadcast; event dropped for bus"
            );
        }
        let listeners = self.event_listeners.load_full();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                warn!(
                    target: "spark_connector::manager",
                    kind = event.name(),
                    "protocol event listener panicked; continuing"
                );
            }
        }
    }

    /// 统一关闭路径：移除表项（并发下仅一个胜者）、关闭通道、广播事件。
    pub(crate) async fn close_channel(&self, channel_id: &str, cause: CloseCause) {
        let Some((id, channel)) = self.registry.remove(channel_id) else {
            debug!(
                target: "spark_connector::manager",
                channel = channel_id,
                cause = %cause,
                "close requested for unknown channel; ignoring"
            );
            return;
        };
        channel.close().await;
        self.publish(ConnectorEvent::ChannelClosed {
            channel_id: id,
            cause,
        });
    }

    /// 出站写路径：先尽力即时写出，再按 ACK 标志决定是否登记重试。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：即时写失败只记日志，要求 ACK 的报文仍然入队，由
    ///   重试泵补偿；
    /// - **契约 (What)**：停机窗口内跳过入队并广播丢弃事件，但即时写出
    ///   照常发生；该不对称为既定行为，保持原样不做重设计。
    pub(crate) async fn write_payload(&self, data: ProtocolData) {
        let Some(channel) = self.registry.get(data.channel_id()) else {
            warn!(
                target: "spark_connector::manager",
                channel = %data.channel_id(),
                "write addressed to unknown channel; dropping"
            );
            return;
        };

        match channel.write(data.bytes().clone()).await {
            Ok(()) => self.publish(ConnectorEvent::FrameSent { data: data.clone() }),
            Err(error) => warn!(
                target: "spark_connector::manager",
                channel = %data.channel_id(),
                error = %error,
                "immediate transport write failed"
            ),
        }

        let datagram = match data.datagram() {
            Ok(datagram) => datagram,
            Err(error) => {
                warn!(
                    target: "spark_connector::manager",
                    channel = %data.channel_id(),
                    error = %error,
                    "outbound frame is not decodable; skipping ack tracking"
                );
                return;
            }
        };
        if !datagram.ack {
            return;
        }
        if self.destroyed() {
            warn!(
                target: "spark_connector::manager",
                channel = %data.channel_id(),
                "connector is shutting down; reliable frame written once without retry tracking"
            );
            self.publish(ConnectorEvent::FrameDiscarded { data });
            return;
        }
        self.retries.insert(datagram.id.clone(), data);
    }

    /// 停机收尾：清空注册表与两类监听器列表。由存活清扫任务在确认
    /// 停机意图后调用。
    pub(crate) fn clear_runtime_state(&self) {
        self.registry.clear();
        self.data_listeners.store(Arc::new(Vec::new()));
        self.event_listeners.store(Arc::new(Vec::new()));
    }
}

/// 派发工作任务：对一帧入站字节完成查表、盖活跃戳与分类处理。
///
/// # 教案式注释
/// - **执行 (How)**：活跃戳先于分类推进，任何成功入站都计入存活；随后按
///   固定偏移的类型字节三分：心跳原路回写、确认消费重试表项、其余扇出给
///   业务监听器；
/// - **契约 (What)**：监听器返回错误或 panic 均被捕获并经 `receive_error`
///   事件上报，不中断对其余监听器的派发；全部成功才广播 `receive_success`。
pub(crate) async fn process_frame(shared: Arc<ConnectorShared>, channel_id: Arc<str>, bytes: Bytes) {
    let Some(channel) = shared.registry.get(&channel_id) else {
        debug!(
            target: "spark_connector::manager",
            channel = %channel_id,
            "frame received for unknown channel; dropping"
        );
        return;
    };
    channel.heartbeat();

    let data = match ProtocolData::new(
        bytes.clone(),
        channel.local_port(),
        channel.remote_host().to_owned(),
        channel_id.clone(),
    ) {
        Ok(data) => data,
        Err(error) => {
            warn!(
                target: "spark_connector::manager",
                channel = %channel_id,
                error = %error,
                "inbound frame rejected"
            );
            shared.publish(ConnectorEvent::ReceiveError {
                channel_id,
                bytes,
                error: Arc::new(error),
            });
            return;
        }
    };

    match data.bytes()[TYPE_INDEX] {
        TYPE_HEARTBEAT => {
            let reply = datagram::build_heartbeat(
                channel.local_port(),
                channel.remote_host(),
                &channel_id,
            );
            match ProtocolData::new(
                reply,
                channel.local_port(),
                channel.remote_host().to_owned(),
                channel_id.clone(),
            ) {
                Ok(out) => shared.write_payload(out).await,
                Err(error) => warn!(
                    target: "spark_connector::manager",
                    channel = %channel_id,
                    error = %error,
                    "failed to assemble heartbeat reply"
                ),
            }
        }
        TYPE_ACK => match data.datagram() {
            Ok(datagram) => {
                if shared.retries.acknowledge(&datagram.id).is_none() {
                    debug!(
                        target: "spark_connector::manager",
                        channel = %channel_id,
                        id = ?datagram.id,
                        "ack without pending retry entry; duplicate or already evicted"
                    );
                }
            }
            Err(error) => {
                warn!(
                    target: "spark_connector::manager",
                    channel = %channel_id,
                    error = %error,
                    "undecodable ack frame"
                );
                shared.publish(ConnectorEvent::ReceiveError {
                    channel_id: channel_id.clone(),
                    bytes,
                    error: Arc::new(error),
                });
            }
        },
        _ => {
            let listeners = shared.data_listeners.load_full();
            let mut failed = false;
            for listener in listeners.iter() {
                let error = match catch_unwind(AssertUnwindSafe(|| listener.on_data(&data))) {
                    Ok(Ok(())) => continue,
                    Ok(Err(error)) => error,
                    Err(_) => ConnectorError::ListenerFailed {
                        channel_id: channel_id.to_string(),
                        detail: "listener panicked".into(),
                    },
                };
                failed = true;
                warn!(
                    target: "spark_connector::manager",
                    channel = %channel_id,
                    error = %error,
                    "protocol data listener failed"
                );
                shared.publish(ConnectorEvent::ReceiveError {
                    channel_id: channel_id.clone(),
                    bytes: bytes.clone(),
                    error: Arc::new(error),
                });
            }
            if !failed {
                shared.publish(ConnectorEvent::ReceiveSuccess {
                    channel_id: channel_id.clone(),
                    bytes,
                });
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Uninit,
    Ready,
    Running,
    Stopping,
}

struct RunningTasks {
    pump: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

struct LifecycleState {
    phase: Phase,
    tasks: Option<RunningTasks>,
}

/// 连接器管理器门面。
///
/// # 教案式说明
/// - **意图 (Why)**：进程内唯一拥有注册表、重试队列、派发池与两个后台
///   任务的所有者，向传输层与业务层暴露统一入口；
/// - **契约 (What)**：
///   - 全部公共操作不返回错误，失败只经事件总线与日志可见；
///   - `start` 之后任意线程可安全调用任意操作；
///   - 对每个注册过的通道，`close` 至多由管理器调用一次；
/// - **风险 (Trade-offs)**：`shutdown` 等待重试队列自然排空（上限约 3 秒）
///   后才返回，调用方若需要硬截止应在外层包裹超时。
pub struct ConnectorManager {
    shared: Arc<ConnectorShared>,
    lifecycle: Mutex<LifecycleState>,
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorManager {
    /// 构造处于未初始化态的管理器。
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ConnectorShared::new()),
            lifecycle: Mutex::new(LifecycleState {
                phase: Phase::Uninit,
                tasks: None,
            }),
        }
    }

    /// 注入配置与事件总线，进入就绪态。不拉起任何任务。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 心跳阈值低于下限时静默钳制并记日志；
    ///   - 总线缺失或传入管理器自身时回退到进程内日志总线；
    ///   - 重复 `init`（非运行态下）允许，注册表与重试队列被重置；
    /// - **风险 (Trade-offs)**：运行态下调用仅记警告，避免热切换配置引入
    ///   半更新状态。
    pub async fn init(&self, config: ConnectorConfig, bus: Option<Arc<dyn EventBus>>) {
        let mut state = self.lifecycle.lock().await;
        if state.phase == Phase::Running {
            warn!(
                target: "spark_connector::manager",
                "init called while running; ignoring"
            );
            return;
        }

        let requested = config.heartbeat_secs;
        let effective = config.effective_heartbeat_secs();
        if effective != requested {
            warn!(
                target: "spark_connector::manager",
                requested,
                effective,
                "heartbeat below protection floor; value clamped"
            );
        }
        self.shared.heartbeat_secs.store(effective, Ordering::Release);
        *self.shared.config.write() = config;

        let resolved: Arc<dyn EventBus> = match bus {
            Some(bus) if !ptr::addr_eq(Arc::as_ptr(&bus), ptr::from_ref(self)) => bus,
            Some(_) => {
                warn!(
                    target: "spark_connector::manager",
                    "self-referential event bus supplied; using in-process logging bus"
                );
                Arc::new(LoggingEventBus)
            }
            None => Arc::new(LoggingEventBus),
        };
        *self.shared.bus.write() = resolved;

        self.shared.registry.clear();
        self.shared.retries.clear();
        state.phase = Phase::Ready;
    }

    /// 进入运行态：创建派发池，拉起重试泵与存活清扫。
    pub async fn start(&self) {
        let mut state = self.lifecycle.lock().await;
        match state.phase {
            Phase::Running => {
                warn!(
                    target: "spark_connector::manager",
                    "start called while already running; ignoring"
                );
                return;
            }
            Phase::Uninit => {
                warn!(
                    target: "spark_connector::manager",
                    "start called before init; ignoring"
                );
                return;
            }
            Phase::Stopping => {
                warn!(
                    target: "spark_connector::manager",
                    "start called during shutdown; ignoring"
                );
                return;
            }
            Phase::Ready => {}
        }

        let capacity = self
            .shared
            .config
            .read()
            .dispatch_concurrency
            .unwrap_or_else(ReceiveDispatcher::default_capacity);
        self.shared.destroyed.store(false, Ordering::Release);
        self.shared
            .dispatcher
            .store(Some(Arc::new(ReceiveDispatcher::new(capacity))));

        let stop = Arc::new(Notify::new());
        let pump = tokio::spawn(retry::run_retry_pump(self.shared.clone(), stop.clone()));
        let sweeper = tokio::spawn(sweep::run_liveness_sweeper(self.shared.clone(), stop));
        state.tasks = Some(RunningTasks { pump, sweeper });
        state.phase = Phase::Running;
        debug!(
            target: "spark_connector::manager",
            capacity,
            "connector manager started"
        );
    }

    /// 协作式停机：停新收、排空派发池、等重试队列排空、收尾清扫后返回。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 置位 `destroyed` 并摘除派发池引用，新帧立即被拒；
    ///   2. 等待派发池在飞任务归还全部许可；
    ///   3. 重试泵观察到标志后继续运转至队列排空，再通知清扫任务；
    ///   4. 清扫任务确认停机意图，清空注册表与监听器列表后退出；
    /// - **契约 (What)**：返回后回到就绪态，可再次 `start`；重复调用仅记
    ///   警告。
    pub async fn shutdown(&self) {
        let mut state = self.lifecycle.lock().await;
        if state.phase != Phase::Running {
            warn!(
                target: "spark_connector::manager",
                "shutdown called while not running; ignoring"
            );
            return;
        }
        state.phase = Phase::Stopping;
        self.shared.destroyed.store(true, Ordering::Release);

        if let Some(dispatcher) = self.shared.dispatcher.swap(None) {
            dispatcher.drain().await;
        }
        if let Some(tasks) = state.tasks.take() {
            if let Err(error) = tasks.pump.await {
                warn!(
                    target: "spark_connector::manager",
                    error = %error,
                    "retry pump task join failed"
                );
            }
            if let Err(error) = tasks.sweeper.await {
                warn!(
                    target: "spark_connector::manager",
                    error = %error,
                    "liveness sweeper task join failed"
                );
            }
        }
        state.phase = Phase::Ready;
        debug!(target: "spark_connector::manager", "connector manager stopped");
    }

    /// 注册一条存活通道。传输层在连接建立后调用。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 同 id 同实例视为重复注册，警告后忽略；
    ///   - 同 id 异实例时旧通道被原子替换，以系统原因关闭并广播；
    ///   - 新表项安装后广播注册事件；
    /// - **前置条件**：仅运行态有效，其余状态警告后返回。
    pub async fn register_channel(&self, channel: Arc<dyn Channel>) {
        if self.shared.destroyed() {
            warn!(
                target: "spark_connector::manager",
                channel = channel.id(),
                "register outside running state; ignoring"
            );
            return;
        }
        if channel.id().is_empty() {
            warn!(
                target: "spark_connector::manager",
                "register with empty channel id; ignoring"
            );
            return;
        }

        let channel_id: Arc<str> = Arc::from(channel.id());
        let remote_host = channel.remote_host().to_owned();
        let local_port = channel.local_port();
        match self.shared.registry.register(channel) {
            RegisterOutcome::AlreadyRegistered => {
                warn!(
                    target: "spark_connector::manager",
                    channel = %channel_id,
                    "channel already registered; duplicate register ignored"
                );
            }
            RegisterOutcome::Replaced(old) => {
                warn!(
                    target: "spark_connector::manager",
                    channel = %channel_id,
                    "duplicate channel id with distinct instance; closing previous channel"
                );
                old.close().await;
                self.shared.publish(ConnectorEvent::ChannelClosed {
                    channel_id: channel_id.clone(),
                    cause: CloseCause::System,
                });
                self.shared.publish(ConnectorEvent::ChannelRegistered {
                    channel_id,
                    remote_host,
                    local_port,
                });
            }
            RegisterOutcome::Installed => {
                self.shared.publish(ConnectorEvent::ChannelRegistered {
                    channel_id,
                    remote_host,
                    local_port,
                });
            }
        }
    }

    /// 传输层入站入口。同步广播接收事件后把帧处理交给派发池，自身不阻塞。
    pub fn receive(&self, bytes: Bytes, channel_id: &str) {
        if self.shared.destroyed() {
            warn!(
                target: "spark_connector::manager",
                channel = channel_id,
                "receive outside running state; frame dropped"
            );
            return;
        }
        if channel_id.is_empty() || bytes.is_empty() {
            warn!(
                target: "spark_connector::manager",
                "receive with empty channel id or empty payload; frame dropped"
            );
            return;
        }

        let channel_id: Arc<str> = Arc::from(channel_id);
        self.shared.publish(ConnectorEvent::FrameReceived {
            channel_id: channel_id.clone(),
            bytes: bytes.clone(),
        });

        let Some(dispatcher) = self.shared.dispatcher.load_full() else {
            warn!(
                target: "spark_connector::manager",
                channel = %channel_id,
                "receive dispatcher unavailable; frame dropped"
            );
            return;
        };
        dispatcher.submit(process_frame(self.shared.clone(), channel_id, bytes));
    }

    /// 出站发报。即时写出后，要求 ACK 的报文进入重试队列直至对端确认。
    pub async fn write(&self, data: ProtocolData) {
        self.shared.write_payload(data).await;
    }

    /// 关闭并移除一条通道，广播关闭原因。
    pub async fn close(&self, channel_id: &str, cause: CloseCause) {
        if self.shared.destroyed() {
            warn!(
                target: "spark_connector::manager",
                channel = channel_id,
                cause = %cause,
                "close outside running state; ignoring"
            );
            return;
        }
        if channel_id.is_empty() {
            warn!(
                target: "spark_connector::manager",
                "close with empty channel id; ignoring"
            );
            return;
        }
        self.shared.close_channel(channel_id, cause).await;
    }

    /// 注册业务报文监听器。写时复制，正在进行的派发不受扰动。
    pub fn register_data_listener(&self, listener: Arc<dyn ProtocolDataListener>) {
        self.shared.data_listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    /// 注册协议事件监听器。
    pub fn register_event_listener(&self, listener: Arc<dyn ProtocolEventListener>) {
        self.shared.event_listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    /// 事件面直通：原始接收。
    pub fn emit_received(&self, channel_id: &str, bytes: Bytes) {
        self.shared.publish(ConnectorEvent::FrameReceived {
            channel_id: Arc::from(channel_id),
            bytes,
        });
    }

    /// 事件面直通：接收成功。
    pub fn emit_receive_success(&self, channel_id: &str, bytes: Bytes) {
        self.shared.publish(ConnectorEvent::ReceiveSuccess {
            channel_id: Arc::from(channel_id),
            bytes,
        });
    }

    /// 事件面直通：接收失败。
    pub fn emit_receive_error(&self, channel_id: &str, bytes: Bytes, error: ConnectorError) {
        self.shared.publish(ConnectorEvent::ReceiveError {
            channel_id: Arc::from(channel_id),
            bytes,
            error: Arc::new(error),
        });
    }

    /// 事件面直通：发送完成。
    pub fn emit_sent(&self, data: ProtocolData) {
        self.shared.publish(ConnectorEvent::FrameSent { data });
    }

    /// 事件面直通：报文丢弃。
    pub fn emit_discarded(&self, data: ProtocolData) {
        self.shared.publish(ConnectorEvent::FrameDiscarded { data });
    }

    /// 事件面直通：应用自定义协议事件。
    pub fn emit_custom(&self, payload: Arc<dyn Any + Send + Sync>) {
        self.shared
            .publish(ConnectorEvent::Custom(CustomEvent { payload }));
    }

    /// 当前存活通道数。
    pub fn channel_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// 当前待确认的重试表项数。
    pub fn pending_retry_count(&self) -> usize {
        self.shared.retries.len()
    }

    /// 管理器是否处于运行态。
    pub fn is_running(&self) -> bool {
        !self.shared.destroyed()
    }
}

impl EventBus for ConnectorManager {
    /// 管理器自身实现完整事件面：对外注入的监听器与总线都经由同一条
    /// 广播路径。
    fn broadcast(&self, event: ConnectorEvent) {
        self.shared.publish(event);
    }
}

impl fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("running", &self.is_running())
            .field("channels", &self.channel_count())
            .field("pending_retries", &self.pending_retry_count())
            .finish()
    }
}
