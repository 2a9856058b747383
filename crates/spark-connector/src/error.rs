//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义连接器管理层的错误域，覆盖传输写失败、通道缺失、监听器异常、
//!   报文解码失败、非法入参与生命周期误用六类路径；
//! - 对外契约不抛错：公共操作的失败只通过事件总线与日志可见，本枚举主要在
//!   内部传递并随 `ReceiveError` 事件携带给观察方。
//!
//! ## 设计要求（What）
//! - 所有变体实现 `thiserror::Error`，兼容 `std::error::Error` 生态；
//! - 每个变体附带稳定错误码（`connector.*` 前缀），可直接作为告警维度；
//! - 变体携带可读上下文（通道 id、失败细节），便于排障时还原现场。

use thiserror::Error;

/// 连接器核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把后台任务吞掉的异常以结构化形式保留下来，既能进日志，
///   也能随事件总线广播给业务侧观察者；
/// - **契约 (What)**：
///   - 所有变体满足 `Send + Sync + 'static`，可安全跨任务传播；
///   - [`code`](Self::code) 返回稳定错误码，语义版本内不变更；
/// - **风险 (Trade-offs)**：上下文采用 `String`，牺牲少量堆分配换取可读性；
///   热路径上仅在失败分支构造，不影响正常收发。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectorError {
    /// 向底层通道写入字节失败。
    ///
    /// - **意图 (Why)**：传输写失败不终止任何任务，只记录并等待重试泵补偿；
    /// - **契约 (What)**：`channel_id` 为目标通道，`detail` 为底层传输的描述。
    #[error("transport write failed on channel `{channel_id}`: {detail}")]
    TransportWriteFailed { channel_id: String, detail: String },

    /// 按 id 查找通道未命中。
    ///
    /// - **契约 (What)**：出现在出站写与重试路径；入站路径对缺失通道仅丢弃加日志。
    #[error("channel `{channel_id}` is not registered")]
    ChannelNotFound { channel_id: String },

    /// 业务监听器处理报文时失败（返回错误或直接 panic）。
    ///
    /// - **意图 (Why)**：监听器异常必须被捕获并经 `receive_error` 事件上报，
    ///   不允许打断同一报文对其余监听器的派发。
    #[error("protocol data listener failed on channel `{channel_id}`: {detail}")]
    ListenerFailed { channel_id: String, detail: String },

    /// 报文头不完整或字段越界，无法解码出数据报视图。
    #[error("datagram decode failed: {detail}")]
    DecodeFailed { detail: String },

    /// 非法入参，例如空的通道 id 或空字节载荷。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// 生命周期误用，例如重复 `start`、未初始化即 `start`、停机后调用运行态接口。
    ///
    /// - **契约 (What)**：`operation` 为被误用的操作名；该错误只进日志，
    ///   对应操作以无副作用方式返回。
    #[error("lifecycle misuse during `{operation}`: {detail}")]
    LifecycleMisuse {
        operation: &'static str,
        detail: String,
    },
}

impl ConnectorError {
    /// 返回稳定错误码。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：日志与事件消费方需要一个不随文案变化的键做聚合统计；
    /// - **契约 (What)**：错误码按 `connector.<域>.<动作>` 命名，语义版本内保持稳定。
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::TransportWriteFailed { .. } => "connector.transport.write_failed",
            ConnectorError::ChannelNotFound { .. } => "connector.channel.not_found",
            ConnectorError::ListenerFailed { .. } => "connector.listener.failed",
            ConnectorError::DecodeFailed { .. } => "connector.codec.decode_failed",
            ConnectorError::InvalidArgument { .. } => "connector.invalid_argument",
            ConnectorError::LifecycleMisuse { .. } => "connector.lifecycle.misuse",
        }
    }
}
