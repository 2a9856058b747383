#![doc = r#"
# spark-connector

## 设计动机（Why）
- **定位**：本 crate 是消息接入侧的连接器管理层。多种传输连接（TCP、
  WebSocket 等）在接入进程终结，解码出的帧经由统一门面分类派发；要求
  确认的出站报文被跟踪重写，直到对端 ACK 或补偿次数耗尽。
- **架构角色**：对下收敛传输层的注册、收帧与断连回调，对上暴露发报与
  监听器注册；观测面以事件总线形式复述，宿主可注入自有实现。
- **设计理念**：四类并发参与者（传输回调、派发工作任务、重试泵、存活
  清扫）共享注册表与重试队列，全部共享状态按单键原子纪律组织，唯一的
  跨任务信号是停机标志。

## 核心契约（What）
- **生命周期**：`init` 注入配置与总线，`start` 拉起后台任务，`shutdown`
  协作式收尾并允许再次启动；运行态之外的运行型操作仅记警告。
- **可靠投递**：要求 ACK 的出站报文先即时写出、再入重试队列；重试泵以
  100 毫秒节拍重写，单报文上限 30 次，对端确认或通道消失即移除。
- **存活治理**：任何成功入站都推进通道活跃戳；空闲超过心跳阈值（下限
  30 秒）的通道由清扫任务以超时原因关闭。
- **错误纪律**：公共操作不返回错误；后台任务吞掉一切业务异常，失败仅
  经事件总线与日志可见。

## 实现策略（How）
- **并发结构**：注册表与重试队列基于分片并发映射；监听器列表写时复制，
  派发遍历注册瞬间的快照；派发池以信号量限定并发度。
- **停机编排**：停机标志置位后，派发池先排空在飞任务，重试泵运转至队列
  排空并通知清扫任务，清扫任务清空注册表与监听器列表后退出。

## 风险与考量（Trade-offs）
- **停机窗口语义**：停机期间 `write` 仍执行即时写出但拒绝重试入队，
  可靠报文在该窗口内可能恰好投递一次而无补偿；该不对称为既定行为。
- **顺序承诺**：跨通道无全序；同通道的多帧可能并发派发，监听器需幂等
  或自行排序。
"#]

pub mod channel;
pub mod config;
pub mod datagram;
mod dispatch;
pub mod error;
pub mod event;
pub mod manager;
pub mod registry;
pub mod retry;
mod sweep;

pub use channel::{Channel, CloseCause};
pub use config::{ConnectorConfig, HEARTBEAT_FLOOR_SECS};
pub use datagram::{Datagram, ProtocolData};
pub use error::ConnectorError;
pub use event::{
    ConnectorEvent, CustomEvent, EventBus, LoggingEventBus, ProtocolDataListener,
    ProtocolEventListener,
};
pub use manager::ConnectorManager;
pub use registry::{ChannelRegistry, RegisterOutcome};
pub use retry::{MAX_ATTEMPTS, RETRY_INTERVAL, RetryEntry, RetryQueue};
