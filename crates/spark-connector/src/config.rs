//! # 连接器配置
//!
//! ## 核心意图（Why）
//! - 把心跳阈值与派发并发度等运行参数从管理器实现中剥离，调用方可通过
//!   serde 从任意配置源反序列化后注入；
//! - 心跳阈值存在保护下限：过小的阈值会让存活清扫误杀慢心跳客户端，
//!   因此低于下限的取值会在 `init` 阶段被静默钳制并记录日志。
//!
//! ## 行为契约（What）
//! - `heartbeat_secs`：存活阈值（秒），生效值不低于 [`HEARTBEAT_FLOOR_SECS`]；
//! - 清扫周期为生效心跳值的五分之一（整数除法，秒），下限保证其不小于 6 秒；
//! - `dispatch_concurrency`：接收派发池的并发上限，缺省按宿主核数推导。

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// 心跳阈值保护下限（秒）。
pub const HEARTBEAT_FLOOR_SECS: u64 = 30;

/// 连接器管理器的运行配置。
///
/// # 教案式说明
/// - **意图 (Why)**：以值对象承载配置，`init` 接收后即拷贝固化，运行期不随
///   外部配置源抖动；
/// - **契约 (What)**：
///   - 派生 serde，可从 TOML/JSON 等配置面直接落地；
///   - `Default` 给出可直接运行的保守取值（心跳 30 秒、并发自动推导）；
/// - **风险 (Trade-offs)**：`heartbeat_secs` 低于下限时不报错而是钳制，
///   调用方若需严格校验应在注入前自行断言。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// 心跳存活阈值（秒）。通道最近活跃时间超过该阈值即被清扫关闭。
    pub heartbeat_secs: u64,
    /// 接收派发池并发上限；`None` 表示按宿主并行度推导（IO 密集型取核数两倍）。
    pub dispatch_concurrency: Option<usize>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: HEARTBEAT_FLOOR_SECS,
            dispatch_concurrency: None,
        }
    }
}

impl ConnectorConfig {
    /// 创建缺省配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置心跳阈值（秒）。低于下限的取值在 `init` 阶段被钳制。
    pub fn with_heartbeat_secs(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    /// 设置接收派发池并发上限。
    pub fn with_dispatch_concurrency(mut self, permits: usize) -> Self {
        self.dispatch_concurrency = Some(permits);
        self
    }

    /// 钳制后的生效心跳阈值（秒）。
    ///
    /// - **契约 (What)**：返回 `max(heartbeat_secs, HEARTBEAT_FLOOR_SECS)`；
    ///   低于下限的配置在此被静默抬升，钳制动作由 `init` 负责记录日志。
    pub fn effective_heartbeat_secs(&self) -> u64 {
        self.heartbeat_secs.max(HEARTBEAT_FLOOR_SECS)
    }

    /// 存活清扫周期。
    ///
    /// - **执行 (How)**：生效心跳值整除 5 后取秒。整数除法为既定行为：
    ///   心跳 30 秒对应 6 秒周期，最坏驱逐时延为 `heartbeat + heartbeat / 5`。
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.effective_heartbeat_secs() / 5)
    }
}
