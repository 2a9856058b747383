//! # 接收派发池
//!
//! ## 核心意图（Why）
//! - 把逐帧处理从传输回调线程上卸载：`receive` 只做事件广播与任务提交，
//!   真正的解码与分发在池内并发执行；
//! - 并发度有界：突发流量下任务排队等待许可，而不是无界扇出拖垮宿主。
//!
//! ## 行为契约（What）
//! - 池不对任何通道做串行化承诺，顺序保证以传输层交付顺序为准，
//!   同一通道的多帧处理可能并发；
//! - 停机时先停止接收新任务，随后等待在飞任务全部归还许可（排空）。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

/// 信号量约束下的接收工作池。
///
/// # 教案式说明
/// - **意图 (Why)**：以「许可数」而非「线程数」表达并发上限，任务仍由
///   运行时调度，池只负责限流；
/// - **契约 (What)**：
///   - [`submit`](Self::submit) 立即返回，任务先取许可再执行；
///   - [`drain`](Self::drain) 取走全部许可以等待在飞与排队任务结束，随后
///     关闭信号量，迟到的任务直接丢弃；
/// - **风险 (Trade-offs)**：排队深度无上界，依赖上游（传输层读循环）天然
///   背压；若接入无背压的传输需在外层追加限流。
#[derive(Debug)]
pub(crate) struct ReceiveDispatcher {
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl ReceiveDispatcher {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1) as u32;
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// IO 密集型缺省并发度：宿主并行度的两倍。
    pub(crate) fn default_capacity() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            * 2
    }

    /// 提交一帧处理任务。调用方不等待执行结果。
    pub(crate) fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                // 池已在停机排空后关闭，迟到任务直接丢弃。
                debug!(
                    target: "spark_connector::dispatch",
                    "dispatcher closed; dropping late frame task"
                );
                return;
            };
            work.await;
        });
    }

    /// 排空在飞任务并关闭池。
    pub(crate) async fn drain(&self) {
        // 先让出一次调度，使已提交但尚未取得许可的任务进入信号量等待队列，
        // 随后的全量获取会公平地排在它们之后。
        tokio::task::yield_now().await;
        if let Ok(all) = self.permits.acquire_many(self.capacity).await {
            all.forget();
        }
        self.permits.close();
    }
}
