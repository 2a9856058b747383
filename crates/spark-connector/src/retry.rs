//! # 重试队列与重试泵
//!
//! ## 核心意图（Why）
//! - 可靠投递的唯一机制：出站报文要求 ACK 时进入队列，由单一重试泵按固定
//!   节拍重写，直到对端确认、尝试次数达到上限或通道消失；
//! - 泵的退出条件与停机流程耦合：`destroyed` 置位后泵继续运转直到队列排空，
//!   随后向存活清扫任务发出停止信号，保证收尾次序稳定。
//!
//! ## 行为契约（What）
//! - 队列键为数据报 id 的原始字节序列，不经过字符集转换；
//! - 每一轮对每个表项恰好做一件事：达到上限驱逐、通道消失驱逐、或
//!   尝试次数加一后重写；写失败只记日志，表项留待下一轮；
//! - 由此推得：停机后队列在至多 `MAX_ATTEMPTS x RETRY_INTERVAL`（3 秒）内
//!   必然排空，泵随之退出。

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::datagram::ProtocolData;
use crate::manager::ConnectorShared;
use crate::registry::ChannelRegistry;

/// 单条报文的重写次数上限。
pub const MAX_ATTEMPTS: u32 = 30;
/// 重试泵的轮询间隔。
pub const RETRY_INTERVAL: core::time::Duration = core::time::Duration::from_millis(100);

/// 一条待确认的出站报文。
#[derive(Clone, Debug)]
pub struct RetryEntry {
    payload: ProtocolData,
    attempts: u32,
}

impl RetryEntry {
    /// 原始出站载荷。
    pub fn payload(&self) -> &ProtocolData {
        &self.payload
    }

    /// 已执行的重写次数，只增不减。
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// 数据报 id 到待确认表项的并发映射。
///
/// # 教案式说明
/// - **意图 (Why)**：封装并发存储与泵的单轮扫描逻辑，写路径、ACK 消费与
///   泵的遍历互不阻塞；
/// - **契约 (What)**：
///   - [`insert`](Self::insert) 以零尝试次数登记新表项，同 id 重写覆盖旧项
///     并重置计数；
///   - [`acknowledge`](Self::acknowledge) 原子移除，重复确认返回 `None`，
///     天然幂等；
/// - **风险 (Trade-offs)**：扫描阶段在分片锁内推进计数、锁外执行异步写，
///   避免持锁跨越 await 点。
#[derive(Debug, Default)]
pub struct RetryQueue {
    inner: DashMap<Bytes, RetryEntry>,
}

impl RetryQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条待确认报文。
    pub fn insert(&self, id: Bytes, payload: ProtocolData) {
        self.inner.insert(id, RetryEntry { payload, attempts: 0 });
    }

    /// 消费对端确认，返回被移除的表项；重复确认返回 `None`。
    pub fn acknowledge(&self, id: &[u8]) -> Option<RetryEntry> {
        self.inner.remove(id).map(|(_, entry)| entry)
    }

    /// 待确认表项数。
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 队列是否已排空。
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 清空队列。
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// 执行一轮扫描：驱逐到期与失联表项，其余推进计数并给出待重写清单。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：遍历期间只做计数推进与裁决收集，遍历结束后再移除
    ///   被驱逐的键，规避在迭代器存活时改写同一分片；
    /// - **后置条件**：返回清单中的每一项都已完成计数加一，调用方在锁外
    ///   逐个执行真正的通道写入。
    pub(crate) fn sweep_pass(
        &self,
        registry: &ChannelRegistry,
    ) -> Vec<(Bytes, Bytes, Arc<dyn Channel>)> {
        let mut evicted: Vec<(Bytes, &'static str)> = Vec::new();
        let mut due = Vec::new();

        for mut entry in self.inner.iter_mut() {
            let id = entry.key().clone();
            if entry.attempts >= MAX_ATTEMPTS {
                evicted.push((id, "attempt cap reached"));
                continue;
            }
            match registry.get(entry.payload.channel_id()) {
                Some(channel) => {
                    entry.attempts += 1;
                    due.push((id, entry.payload.bytes().clone(), channel));
                }
                None => evicted.push((id, "channel gone")),
            }
        }

        for (id, reason) in evicted {
            if self.inner.remove(&id).is_some() {
                warn!(
                    target: "spark_connector::retry",
                    id = ?id,
                    reason,
                    "evicting unacknowledged datagram from retry queue"
                );
            }
        }

        due
    }
}

/// 重试泵主循环。`start` 时作为独立任务拉起。
///
/// # 教案式注释
/// - **意图 (Why)**：集中单点执行全部重写，避免多任务竞争同一表项；
/// - **契约 (What)**：
///   - 循环条件：未停机，或队列尚未排空；两者都不成立时退出；
///   - 每轮扫描完成后休眠 [`RETRY_INTERVAL`]；
///   - 退出前通过 `sweeper_stop` 通知存活清扫任务进入收尾；
/// - **风险 (Trade-offs)**：单泵意味着所有通道的重写串行执行，吞吐受最慢
///   通道影响；重写本就是低频补偿路径，接受该权衡。
pub(crate) async fn run_retry_pump(shared: Arc<ConnectorShared>, sweeper_stop: Arc<Notify>) {
    loop {
        if shared.destroyed() && shared.retries().is_empty() {
            break;
        }

        for (id, bytes, channel) in shared.retries().sweep_pass(shared.registry()) {
            if let Err(error) = channel.write(bytes).await {
                // 写失败不驱逐，表项留待下一轮或由上限兜底。
                warn!(
                    target: "spark_connector::retry",
                    id = ?id,
                    channel = channel.id(),
                    error = %error,
                    "retry write failed; keeping entry for next pass"
                );
            }
        }

        tokio::time::sleep(RETRY_INTERVAL).await;
    }

    debug!(
        target: "spark_connector::retry",
        "retry queue drained; signalling liveness sweeper to stop"
    );
    sweeper_stop.notify_one();
}
