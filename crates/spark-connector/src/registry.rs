//! # 通道注册表
//!
//! ## 核心意图（Why）
//! - 提供基于 `DashMap` 的并发安全存储，维护「通道 id 到存活通道」的唯一
//!   映射：注册、关闭移除与存活清扫会从不同任务并发触碰同一张表；
//! - 同 id 重复注册必须原子裁决：`contains + get + put` 的三段式检查存在
//!   竞态窗口，两次并发注册可能都观察到「不存在」，导致旧通道泄露未关闭，
//!   因此注册走分片锁内的 entry 原语一次完成。
//!
//! ## 行为契约（What）
//! - [`register`](ChannelRegistry::register)：put-if-absent，命中同实例时
//!   判为重复注册，命中异实例时原子替换并交还旧通道由调用方关闭；
//! - [`remove`](ChannelRegistry::remove)：原子移除，并发关闭时只有一个
//!   胜者拿到通道，保证 `close` 至多调用一次；
//! - [`snapshot`](ChannelRegistry::snapshot)：为清扫任务复制当前表项，
//!   遍历期间不持有分片锁。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::channel::Channel;

/// 注册一条通道的裁决结果。
#[derive(Debug)]
pub enum RegisterOutcome {
    /// 该 id 此前无表项，新通道已安装。
    Installed,
    /// 同 id 存在异实例，旧通道被原子替换并交还，调用方负责以系统原因关闭。
    Replaced(Arc<dyn Channel>),
    /// 同 id 同实例，视为重复注册，表项不变。
    AlreadyRegistered,
}

/// 通道 id 到存活通道的并发映射。
///
/// # 教案式说明
/// - **意图 (Why)**：封装并发原语，上层不直接触碰 `DashMap`，注册语义的
///   原子性集中在此保证；
/// - **契约 (What)**：键为 `Arc<str>`，与 [`ProtocolData`](crate::datagram::ProtocolData)
///   的通道 id 零拷贝互通；同一 id 任一时刻至多对应一个存活通道；
/// - **风险 (Trade-offs)**：`get` 返回克隆出的 `Arc` 而非 guard，避免调用方
///   在持有分片锁期间执行异步写入。
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    inner: DashMap<Arc<str>, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子注册一条通道。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：通过 entry 原语在分片锁内一次完成「不存在则插入、
    ///   同实例则拒绝、异实例则替换」三种裁决；
    /// - **后置条件**：返回 [`RegisterOutcome::Replaced`] 时旧通道已不在表中，
    ///   调用方必须对其执行关闭与事件广播。
    pub fn register(&self, channel: Arc<dyn Channel>) -> RegisterOutcome {
        let key: Arc<str> = Arc::from(channel.id());
        match self.inner.entry(key) {
            Entry::Occupied(mut occupied) => {
                if Arc::ptr_eq(occupied.get(), &channel) {
                    RegisterOutcome::AlreadyRegistered
                } else {
                    let old = occupied.insert(channel);
                    RegisterOutcome::Replaced(old)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(channel);
                RegisterOutcome::Installed
            }
        }
    }

    /// 按 id 查找通道，返回克隆出的共享引用。
    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn Channel>> {
        self.inner.get(channel_id).map(|entry| entry.value().clone())
    }

    /// 原子移除表项，返回键与通道。并发调用时至多一个胜者。
    pub fn remove(&self, channel_id: &str) -> Option<(Arc<str>, Arc<dyn Channel>)> {
        self.inner.remove(channel_id)
    }

    /// 复制当前全部表项，供清扫任务在锁外遍历。
    pub fn snapshot(&self) -> Vec<(Arc<str>, Arc<dyn Channel>)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 当前存活通道数。
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 清空注册表。仅在有序停机的收尾阶段调用。
    pub fn clear(&self) {
        self.inner.clear();
    }
}
