//! 连接器管理器端到端行为用例。
//!
//! 全部用例运行在暂停时钟的单线程运行时上：重试节拍（100 毫秒）与存活
//! 清扫窗口（数十秒）都以虚拟时间推进，用例既确定又即时完成。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use spark_connector::datagram::{self, TYPE_HEARTBEAT};
use spark_connector::{
    Channel, CloseCause, ConnectorConfig, ConnectorError, ConnectorEvent, ConnectorManager,
    EventBus, ProtocolData, ProtocolDataListener,
};

/// 记录每次写入与关闭次数的测试通道。
#[derive(Debug)]
struct MockChannel {
    id: String,
    host: String,
    port: u16,
    last_active: Mutex<Instant>,
    writes: Mutex<Vec<(Instant, Bytes)>>,
    closed: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MockChannel {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            host: "10.0.0.7".to_owned(),
            port: 9000,
            last_active: Mutex::new(Instant::now()),
            writes: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().iter().map(|(_, b)| b.clone()).collect()
    }

    fn write_times(&self) -> Vec<Instant> {
        self.writes.lock().iter().map(|(t, _)| *t).collect()
    }

    fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }
    fn remote_host(&self) -> &str {
        &self.host
    }
    fn local_port(&self) -> u16 {
        self.port
    }
    fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }
    fn heartbeat(&self) {
        *self.last_active.lock() = Instant::now();
    }
    async fn write(&self, payload: Bytes) -> Result<(), ConnectorError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConnectorError::TransportWriteFailed {
                channel_id: self.id.clone(),
                detail: "injected failure".to_owned(),
            });
        }
        self.writes.lock().push((Instant::now(), payload));
        Ok(())
    }
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// 逐条留存事件的测试总线。
#[derive(Debug, Default)]
struct RecordingBus {
    events: Mutex<Vec<ConnectorEvent>>,
}

impl RecordingBus {
    fn events(&self) -> Vec<ConnectorEvent> {
        self.events.lock().clone()
    }

    fn closed(&self) -> Vec<(Arc<str>, CloseCause)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectorEvent::ChannelClosed { channel_id, cause } => Some((channel_id, cause)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }
}

impl EventBus for RecordingBus {
    fn broadcast(&self, event: ConnectorEvent) {
        self.events.lock().push(event);
    }
}

/// 留存业务报文的监听器，可注入失败。
#[derive(Default)]
struct RecordingListener {
    seen: Mutex<Vec<ProtocolData>>,
    fail: bool,
}

impl RecordingListener {
    fn seen(&self) -> Vec<ProtocolData> {
        self.seen.lock().clone()
    }
}

impl ProtocolDataListener for RecordingListener {
    fn on_data(&self, data: &ProtocolData) -> Result<(), ConnectorError> {
        if self.fail {
            return Err(ConnectorError::ListenerFailed {
                channel_id: data.channel_id().to_string(),
                detail: "injected listener failure".to_owned(),
            });
        }
        self.seen.lock().push(data.clone());
        Ok(())
    }
}

struct PanickingListener;

impl ProtocolDataListener for PanickingListener {
    fn on_data(&self, _data: &ProtocolData) -> Result<(), ConnectorError> {
        panic!("listener blew up");
    }
}

/// 让已就绪的后台任务执行并推进少量虚拟时间。
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn running_manager(bus: Arc<RecordingBus>) -> ConnectorManager {
    let manager = ConnectorManager::new();
    let bus: Arc<dyn EventBus> = bus;
    manager
        .init(ConnectorConfig::new().with_heartbeat_secs(30), Some(bus))
        .await;
    manager.start().await;
    settle().await;
    manager
}

fn reliable(id: &[u8]) -> ProtocolData {
    let bytes = datagram::encode(9, true, id, b"body").unwrap();
    ProtocolData::new(bytes, 9000, "10.0.0.7", "c1").unwrap()
}

fn heartbeat_frame() -> Bytes {
    datagram::encode(TYPE_HEARTBEAT, false, b"ping", &[]).unwrap()
}

fn business_frame(id: &[u8], body: &[u8]) -> Bytes {
    datagram::encode(9, false, id, body).unwrap()
}

#[tokio::test(start_paused = true)]
async fn heartbeat_round_trip_replies_and_stamps_activity() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    let stamped_before = c1.last_active();
    tokio::time::sleep(Duration::from_secs(1)).await;

    manager.receive(heartbeat_frame(), "c1");
    settle().await;

    assert!(c1.last_active() > stamped_before);
    let writes = c1.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0], datagram::build_heartbeat(9000, "10.0.0.7", "c1"));
    assert_eq!(bus.count("frame_received"), 1);
    assert_eq!(bus.count("frame_sent"), 1);
}

#[tokio::test(start_paused = true)]
async fn reliable_delivery_acknowledged_before_first_retry() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    manager.write(reliable(b"m1")).await;
    assert_eq!(manager.pending_retry_count(), 1);

    manager.receive(datagram::build_ack(b"m1"), "c1");
    settle().await;
    assert_eq!(manager.pending_retry_count(), 0);

    // 跨过若干个重试节拍，确认没有补发。
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(c1.writes().len(), 1);

    // 重复确认是无害的空操作。
    manager.receive(datagram::build_ack(b"m1"), "c1");
    settle().await;
    assert_eq!(manager.pending_retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_frame_is_retried_to_cap_then_evicted() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    manager.write(reliable(b"m1")).await;
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(manager.pending_retry_count(), 0);
    let times = c1.write_times();
    assert_eq!(times.len(), 31, "one immediate write plus thirty retries");

    let first_retry = times[1];
    let last_retry = times[30];
    let span = last_retry - first_retry;
    assert!(span >= Duration::from_millis(2800), "span was {span:?}");
    assert!(span <= Duration::from_millis(3000), "span was {span:?}");
}

#[tokio::test(start_paused = true)]
async fn channel_loss_during_retry_evicts_without_writes() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    manager.write(reliable(b"m2")).await;
    manager.close("c1", CloseCause::System).await;
    assert_eq!(c1.closed_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.pending_retry_count(), 0);
    assert_eq!(c1.writes().len(), 1, "only the immediate write may happen");

    // 再次关闭是带告警的空操作，不会二次触达通道。
    manager.close("c1", CloseCause::System).await;
    assert_eq!(c1.closed_count(), 1);
    assert_eq!(bus.closed(), vec![(Arc::from("c1"), CloseCause::System)]);
}

#[tokio::test(start_paused = true)]
async fn idle_channel_is_evicted_within_heartbeat_window() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(c1.closed_count(), 1);
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(bus.closed(), vec![(Arc::from("c1"), CloseCause::Timeout)]);
}

#[tokio::test(start_paused = true)]
async fn active_channel_survives_sweeps() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    // 每 10 秒一帧心跳，远在 30 秒阈值之内。
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        manager.receive(heartbeat_frame(), "c1");
        settle().await;
    }

    assert_eq!(c1.closed_count(), 0);
    assert_eq!(manager.channel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_register_replaces_and_closes_previous_instance() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1a = MockChannel::new("c1");
    let c1b = MockChannel::new("c1");

    manager.register_channel(c1a.clone()).await;
    manager.register_channel(c1b.clone()).await;

    assert_eq!(c1a.closed_count(), 1);
    assert_eq!(c1b.closed_count(), 0);
    assert_eq!(bus.closed(), vec![(Arc::from("c1"), CloseCause::System)]);

    // 同实例重复注册是带告警的空操作。
    manager.register_channel(c1b.clone()).await;
    assert_eq!(manager.channel_count(), 1);

    // 后续入站路由到替换后的实例。
    manager.receive(heartbeat_frame(), "c1");
    settle().await;
    assert_eq!(c1a.writes().len(), 0);
    assert_eq!(c1b.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn business_frames_fan_out_in_registration_order() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    let first = Arc::new(RecordingListener::default());
    let second = Arc::new(RecordingListener::default());
    manager.register_data_listener(first.clone());
    manager.register_data_listener(second.clone());

    manager.receive(business_frame(b"b1", b"hello"), "c1");
    settle().await;

    let seen = first.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(&**seen[0].channel_id(), "c1");
    assert_eq!(seen[0].datagram().unwrap().body.as_ref(), b"hello");
    assert_eq!(second.seen().len(), 1);
    assert_eq!(bus.count("receive_success"), 1);
    assert_eq!(bus.count("receive_error"), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_listener_is_reported_and_does_not_block_others() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    let failing = Arc::new(RecordingListener {
        seen: Mutex::new(Vec::new()),
        fail: true,
    });
    let healthy = Arc::new(RecordingListener::default());
    manager.register_data_listener(failing);
    manager.register_data_listener(healthy.clone());

    manager.receive(business_frame(b"b2", b"payload"), "c1");
    settle().await;

    assert_eq!(healthy.seen().len(), 1);
    assert_eq!(bus.count("receive_error"), 1);
    assert_eq!(bus.count("receive_success"), 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_kill_the_dispatcher() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    manager.register_data_listener(Arc::new(PanickingListener));
    manager.receive(business_frame(b"b3", b"boom"), "c1");
    settle().await;
    assert_eq!(bus.count("receive_error"), 1);

    // 派发池仍然存活，后续帧照常处理。
    manager.receive(heartbeat_frame(), "c1");
    settle().await;
    assert_eq!(c1.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_retries_clears_state_and_allows_restart() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    manager.write(reliable(b"m3")).await;
    manager.shutdown().await;

    assert!(!manager.is_running());
    assert_eq!(manager.pending_retry_count(), 0, "queue drains before exit");
    assert_eq!(manager.channel_count(), 0, "sweeper clears the registry");

    // 重复停机是带告警的空操作。
    manager.shutdown().await;

    // 就绪态允许再次启动，注册与收发恢复工作。
    manager.start().await;
    settle().await;
    assert!(manager.is_running());

    let c2 = MockChannel::new("c2");
    manager.register_channel(c2.clone()).await;
    manager.receive(heartbeat_frame(), "c2");
    settle().await;
    assert_eq!(c2.writes().len(), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn write_during_shutdown_delivers_once_without_retry_tracking() {
    let bus = Arc::new(RecordingBus::default());
    let manager = Arc::new(ConnectorManager::new());
    let bus_dyn: Arc<dyn EventBus> = bus.clone();
    manager
        .init(ConnectorConfig::new().with_heartbeat_secs(30), Some(bus_dyn))
        .await;
    manager.start().await;
    settle().await;

    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    let writer = manager.clone();
    tokio::join!(manager.shutdown(), async move {
        writer.write(reliable(b"m9")).await;
    });

    // 即时写出仍然发生，但停机窗口内拒绝入队并广播丢弃事件。
    assert_eq!(c1.writes().len(), 1);
    assert_eq!(bus.count("frame_discarded"), 1);
    assert_eq!(manager.pending_retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn operations_outside_running_state_are_warned_no_ops() {
    let bus = Arc::new(RecordingBus::default());
    let manager = ConnectorManager::new();
    let bus_dyn: Arc<dyn EventBus> = bus.clone();
    manager
        .init(ConnectorConfig::new().with_heartbeat_secs(30), Some(bus_dyn))
        .await;

    // 未启动：注册、收帧与关闭都只告警返回。
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;
    manager.receive(heartbeat_frame(), "c1");
    manager.close("c1", CloseCause::Peer).await;
    assert_eq!(manager.channel_count(), 0);
    assert!(bus.events().is_empty());

    manager.start().await;
    settle().await;

    // 重复启动是带告警的空操作，不会重建后台任务。
    manager.start().await;
    assert!(manager.is_running());

    // 非法入参：空通道 id 直接丢弃。
    manager.receive(heartbeat_frame(), "");
    manager.close("", CloseCause::Peer).await;
    assert_eq!(bus.count("channel_closed"), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transport_write_failure_is_swallowed_and_retried() {
    let bus = Arc::new(RecordingBus::default());
    let manager = running_manager(bus.clone()).await;
    let c1 = MockChannel::new("c1");
    manager.register_channel(c1.clone()).await;

    c1.fail_writes.store(true, Ordering::SeqCst);
    manager.write(reliable(b"m4")).await;
    assert_eq!(manager.pending_retry_count(), 1, "enqueue survives a failed write");

    // 传输恢复后，下一个节拍补发成功。
    c1.fail_writes.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!c1.writes().is_empty());

    manager.receive(datagram::build_ack(b"m4"), "c1");
    settle().await;
    assert_eq!(manager.pending_retry_count(), 0);
}
