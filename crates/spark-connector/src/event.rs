//! # 连接器事件与观测总线
//!
//! ## 核心意图（Why）
//! - 把通道注册、帧收发、丢弃与关闭等关键节点标准化为 [`ConnectorEvent`]，
//!   供事件总线与协议事件监听器消费，替代不透明的日志散点；
//! - 观测永远不在关键路径上：广播必须快速返回，监听器的失败或 panic
//!   不允许影响任何协议动作。
//!
//! ## 契约说明（What）
//! - [`EventBus::broadcast`] 需线程安全且不阻塞；若实现内部需要缓冲，
//!   应自行保证有界与溢出策略；
//! - 事件对象视为不可变，字节负载以 `Bytes` 共享，克隆代价为引用计数。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::CloseCause;
use crate::datagram::ProtocolData;
use crate::error::ConnectorError;

/// 应用自定义协议事件的载体。
///
/// - **意图 (Why)**：为尚未标准化的协议信号保留开放扩展位，
///   上层以 `Any` 向下转型取回具体类型；
/// - **风险 (Trade-offs)**：开放扩展要求使用方维护良好的类型命名空间，
///   避免不同组件对同一载荷类型产生歧义。
#[derive(Clone)]
pub struct CustomEvent {
    /// 任意协议事件负载。
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for CustomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomEvent").finish_non_exhaustive()
    }
}

/// 连接器生命周期与 I/O 事件。
///
/// # 教案式说明
/// - **意图 (Why)**：一个枚举覆盖管理层全部观测面，事件总线实现只需
///   处理单一类型；
/// - **契约 (What)**：
///   - 所有变体可克隆，广播方持有原件、监听方持有副本；
///   - [`name`](Self::name) 返回稳定标签，适合作为指标与告警维度；
/// - **风险 (Trade-offs)**：`ReceiveError` 携带完整错误对象，监听方不应
///   依赖其 `Display` 文案做程序化判断，应使用错误码。
#[derive(Clone, Debug)]
pub enum ConnectorEvent {
    /// 新通道进入注册表。
    ChannelRegistered {
        channel_id: Arc<str>,
        remote_host: String,
        local_port: u16,
    },
    /// 传输层递交了一帧原始字节。
    FrameReceived { channel_id: Arc<str>, bytes: Bytes },
    /// 一帧业务报文被全部监听器成功消费。
    ReceiveSuccess { channel_id: Arc<str>, bytes: Bytes },
    /// 入站处理失败（解码失败或监听器异常）。
    ReceiveError {
        channel_id: Arc<str>,
        bytes: Bytes,
        error: Arc<ConnectorError>,
    },
    /// 一帧出站字节成功写入通道。
    FrameSent { data: ProtocolData },
    /// 可靠报文在停机窗口内被拒绝入队，仅完成即时写出。
    FrameDiscarded { data: ProtocolData },
    /// 通道被关闭并移出注册表。
    ChannelClosed {
        channel_id: Arc<str>,
        cause: CloseCause,
    },
    /// 应用自定义协议事件。
    Custom(CustomEvent),
}

impl ConnectorEvent {
    /// 事件的稳定标签。
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorEvent::ChannelRegistered { .. } => "channel_registered",
            ConnectorEvent::FrameReceived { .. } => "frame_received",
            ConnectorEvent::ReceiveSuccess { .. } => "receive_success",
            ConnectorEvent::ReceiveError { .. } => "receive_error",
            ConnectorEvent::FrameSent { .. } => "frame_sent",
            ConnectorEvent::FrameDiscarded { .. } => "frame_discarded",
            ConnectorEvent::ChannelClosed { .. } => "channel_closed",
            ConnectorEvent::Custom(..) => "custom",
        }
    }
}

/// 观测事件总线契约。
///
/// # 教案式说明
/// - **意图 (Why)**：管理层对外复述全部事件面，宿主可注入自有总线对接
///   指标、审计或跨进程投递；
/// - **契约 (What)**：`broadcast` 必须快速返回；实现内部的失败不得向
///   调用方传播；
/// - **风险 (Trade-offs)**：管理层会在广播外层兜底捕获 panic，但实现仍
///   应自行保证健壮，兜底只是最后防线。
pub trait EventBus: Send + Sync + 'static {
    /// 广播一个事件。
    fn broadcast(&self, event: ConnectorEvent);
}

/// 缺省的进程内事件总线：把事件落为结构化日志。
///
/// - **意图 (Why)**：宿主未注入总线（或误把管理器自身当总线传入）时的
///   安全缺省，保证观测面始终存在；
/// - **契约 (What)**：仅产生 `trace` 级日志，不持有状态、不会失败。
#[derive(Debug, Default)]
pub struct LoggingEventBus;

impl EventBus for LoggingEventBus {
    fn broadcast(&self, event: ConnectorEvent) {
        tracing::trace!(
            target: "spark_connector::event",
            kind = event.name(),
            event = ?event,
            "connector event"
        );
    }
}

/// 业务报文监听器。
///
/// # 教案式说明
/// - **意图 (Why)**：非控制帧按注册顺序派发给全部监听器，承载业务扇出；
/// - **契约 (What)**：
///   - 返回 `Err` 表示该监听器处理失败，管理层把失败经 `receive_error`
///     事件上报后继续派发其余监听器；
///   - 同一通道的多帧可能并发派发，实现需幂等或自行排序；
/// - **风险 (Trade-offs)**：监听器在派发工作线程上同步执行，耗时逻辑应
///   自行转移到业务线程池。
pub trait ProtocolDataListener: Send + Sync + 'static {
    /// 消费一帧业务报文。
    fn on_data(&self, data: &ProtocolData) -> Result<(), ConnectorError>;
}

/// 协议事件监听器，接收管理层广播的全部 [`ConnectorEvent`]。
pub trait ProtocolEventListener: Send + Sync + 'static {
    /// 观察一个事件。实现不应阻塞。
    fn on_event(&self, event: &ConnectorEvent);
}
