//! # 通道契约
//!
//! ## 角色定位（Why）
//! - [`Channel`] 是管理层与具体传输实现（TCP、WebSocket 等）之间的唯一接口：
//!   传输层在连接建立时构造实现并注册，管理层此后只通过该契约写字节、
//!   盖活跃戳与关闭；
//! - 管理层保证对每个注册过的通道至多调用一次 [`Channel::close`]，
//!   关闭后的实例不得复用。
//!
//! ## 并发要求（What）
//! - 实现必须 `Send + Sync`：写入、活跃戳与关闭可能来自派发工作线程、
//!   重试泵与清扫任务中的任意一个；
//! - [`Channel::last_active`] 以单调时钟表示，活跃戳只能前进。

use core::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::error::ConnectorError;

/// 通道关闭原因，随关闭事件广播。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseCause {
    /// 管理侧主动关闭，例如同 id 重复注册时替换旧实例。
    System,
    /// 超过心跳阈值未活跃，由存活清扫驱逐。
    Timeout,
    /// 对端断开，由传输层上报。
    Peer,
}

impl CloseCause {
    /// 稳定的小写标签，用于日志与事件维度。
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::System => "system",
            CloseCause::Timeout => "timeout",
            CloseCause::Peer => "peer",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条存活的客户端连接。
///
/// # 教案式说明
/// - **意图 (Why)**：屏蔽具体传输细节，管理层只依赖寻址元数据、活跃戳与
///   字节写入能力；
/// - **契约 (What)**：
///   - `id` 在注册表存活期间唯一且稳定；
///   - `heartbeat` 把活跃戳推进到当前时刻，任何成功的入站帧都会触发；
///   - `write` 失败返回 [`ConnectorError::TransportWriteFailed`]，由调用侧
///     决定吞掉还是依赖重试泵补偿；
///   - `close` 需幂等实现以自保，但管理层承诺至多调用一次；
/// - **风险 (Trade-offs)**：`last_active` 读取与 `heartbeat` 写入并发发生，
///   实现应使用原子量或锁保证读到的时间戳完整。
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// 通道 id，注册表的键。
    fn id(&self) -> &str;

    /// 对端主机。
    fn remote_host(&self) -> &str;

    /// 本端监听端口。
    fn local_port(&self) -> u16;

    /// 最近一次活跃时刻（单调时钟）。
    fn last_active(&self) -> Instant;

    /// 把活跃戳推进到当前时刻。
    fn heartbeat(&self);

    /// 向对端写出一帧字节。
    async fn write(&self, payload: Bytes) -> Result<(), ConnectorError>;

    /// 关闭底层连接并释放资源。
    async fn close(&self);
}
