//! # 存活清扫任务
//!
//! ## 核心意图（Why）
//! - 周期性驱逐超过心跳阈值未活跃的通道，防止半死连接占用注册表与对端资源；
//! - 同时承担停机收尾：收到停止信号且确认 `destroyed` 置位后，清空注册表
//!   与监听器列表再退出，保证下一次启动从干净状态开始。
//!
//! ## 行为契约（What）
//! - 清扫周期为生效心跳值的五分之一（秒，整数除法）；
//! - 逐项计算空闲秒数，严格大于心跳阈值才驱逐，驱逐走统一的关闭路径并
//!   广播超时原因；
//! - 停止信号以 `destroyed` 标志消歧：标志未置位的唤醒视为虚假信号，
//!   记日志后继续巡检。

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::CloseCause;
use crate::manager::ConnectorShared;

/// 存活清扫主循环。`start` 时作为独立任务拉起。
///
/// # 教案式注释
/// - **执行 (How)**：每轮在「停止信号」与「周期到点」之间二选一；到点则对
///   注册表快照逐项核对空闲时长，快照遍历不持有分片锁；
/// - **契约 (What)**：单轮内的任何失败只记日志，任务本身永不因业务异常退出；
/// - **风险 (Trade-offs)**：快照语义下，清扫期间新注册的通道要到下一轮才被
///   纳入巡检，最坏驱逐时延为 `heartbeat + heartbeat / 5`。
pub(crate) async fn run_liveness_sweeper(shared: Arc<ConnectorShared>, stop: Arc<Notify>) {
    loop {
        let period = shared.sweep_period();
        tokio::select! {
            _ = stop.notified() => {
                if shared.destroyed() {
                    shared.clear_runtime_state();
                    debug!(
                        target: "spark_connector::sweep",
                        "liveness sweeper stopped; registry and listener lists cleared"
                    );
                    break;
                }
                warn!(
                    target: "spark_connector::sweep",
                    "liveness sweeper woken without teardown intent; treating as spurious"
                );
            }
            _ = tokio::time::sleep(period) => {
                sweep_once(&shared).await;
            }
        }
    }
}

/// 对注册表做一轮空闲核对。
async fn sweep_once(shared: &ConnectorShared) {
    let heartbeat_secs = shared.heartbeat_secs();
    let now = Instant::now();

    for (channel_id, channel) in shared.registry().snapshot() {
        let idle_secs = now.saturating_duration_since(channel.last_active()).as_secs();
        if idle_secs > heartbeat_secs {
            debug!(
                target: "spark_connector::sweep",
                channel = %channel_id,
                idle_secs,
                heartbeat_secs,
                "channel exceeded heartbeat window; evicting"
            );
            shared.close_channel(&channel_id, CloseCause::Timeout).await;
        }
    }
}
