//! 高频消息合批
//!
//! 按通道累积消息，固定窗口到期后一次性以数组形式交给 sink。
//! 窗口在通道第一条消息到达时开启，后续 `add` 不会重置计时（不是滑动防抖）。
//!
//! 计时器跑在创建合批器时所在的 tokio 运行时上，因此 `add` 可以从运行时之外的
//! 线程调用（例如 GPS 回调线程）；创建时不在运行时内、调用时也不在的话，消息不合批、立即交付。

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{Qos, Transport};

/// 合批结果的接收方
pub trait BatchSink<T>: Send + Sync {
    fn deliver(&self, channel: &str, items: Vec<T>);
}

impl<T, F> BatchSink<T> for F
where
    F: Fn(&str, Vec<T>) + Send + Sync,
{
    fn deliver(&self, channel: &str, items: Vec<T>) {
        self(channel, items)
    }
}

/// 合批统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub items_added: u64,
    pub flushes: u64,
    pub items_flushed: u64,
    /// 没有 sink 时被丢弃的条数
    pub items_discarded: u64,
}

struct ChannelQueue<T> {
    items: Vec<T>,
    window: u64,
    timer: Option<JoinHandle<()>>,
}

struct BatcherState<T> {
    channels: HashMap<String, ChannelQueue<T>>,
    sink: Option<Arc<dyn BatchSink<T>>>,
    next_window: u64,
    disposed: bool,
    stats: BatcherStats,
}

struct BatcherShared<T> {
    interval: Duration,
    runtime: Option<Handle>,
    state: Mutex<BatcherState<T>>,
}

/// 按通道合批器
pub struct MessageBatcher<T> {
    shared: Arc<BatcherShared<T>>,
}

impl<T> Clone for MessageBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for MessageBatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MessageBatcher")
            .field("interval", &self.shared.interval)
            .field("channels", &state.channels.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<T: Send + 'static> MessageBatcher<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(BatcherShared {
                interval,
                runtime: Handle::try_current().ok(),
                state: Mutex::new(BatcherState {
                    channels: HashMap::new(),
                    sink: None,
                    next_window: 0,
                    disposed: false,
                    stats: BatcherStats::default(),
                }),
            }),
        }
    }

    pub fn with_sink(interval: Duration, sink: Arc<dyn BatchSink<T>>) -> Self {
        let batcher = Self::new(interval);
        batcher.set_sink(sink);
        batcher
    }

    pub fn set_sink(&self, sink: Arc<dyn BatchSink<T>>) {
        self.shared.state.lock().sink = Some(sink);
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// 追加一条消息；`dispose()` 之后返回 false
    pub fn add(&self, channel: &str, item: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.disposed {
            debug!("合批器已释放，忽略消息: {}", channel);
            return false;
        }
        state.stats.items_added += 1;

        if let Some(queue) = state.channels.get_mut(channel) {
            queue.items.push(item);
            return true;
        }

        let runtime = match self.shared.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                warn!("没有可用的 tokio 运行时，通道 {} 的消息直接发送", channel);
                let sink = state.sink.clone();
                drop(state);
                self.shared.deliver(channel, sink, vec![item]);
                return true;
            }
        };

        state.next_window += 1;
        let window = state.next_window;
        let timer = runtime.spawn(window_timer(
            Arc::downgrade(&self.shared),
            channel.to_string(),
            window,
        ));
        state.channels.insert(
            channel.to_string(),
            ChannelQueue {
                items: vec![item],
                window,
                timer: Some(timer),
            },
        );
        true
    }

    /// 立即发送该通道已累积的消息，返回条数
    pub fn flush(&self, channel: &str) -> usize {
        let (sink, items) = {
            let mut state = self.shared.state.lock();
            let items = match state.channels.remove(channel) {
                Some(mut queue) => {
                    if let Some(timer) = queue.timer.take() {
                        timer.abort();
                    }
                    queue.items
                }
                None => Vec::new(),
            };
            (state.sink.clone(), items)
        };
        self.shared.deliver(channel, sink, items)
    }

    /// 发送所有通道的累积消息，返回总条数
    pub fn flush_all(&self) -> usize {
        let channels: Vec<String> = self.shared.state.lock().channels.keys().cloned().collect();
        channels.iter().map(|channel| self.flush(channel)).sum()
    }

    /// 取消全部计时器并清空状态；可重复调用
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        let dropped: usize = state
            .channels
            .drain()
            .map(|(_, mut queue)| {
                if let Some(timer) = queue.timer.take() {
                    timer.abort();
                }
                queue.items.len()
            })
            .sum();
        state.sink = None;
        if dropped > 0 {
            warn!("合批器释放，丢弃 {} 条未发送消息", dropped);
        }
    }

    pub fn pending(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |queue| queue.items.len())
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    pub fn stats(&self) -> BatcherStats {
        self.shared.state.lock().stats.clone()
    }
}

impl<T> BatcherShared<T> {
    /// 计时器到期：只发送本窗口的数据
    fn flush_window(&self, channel: &str, window: u64) {
        let (sink, items) = {
            let mut state = self.state.lock();
            match state.channels.get(channel) {
                Some(queue) if queue.window == window => {}
                _ => return,
            }
            let items = state
                .channels
                .remove(channel)
                .map(|queue| queue.items)
                .unwrap_or_default();
            (state.sink.clone(), items)
        };
        self.deliver(channel, sink, items);
    }

    fn deliver(&self, channel: &str, sink: Option<Arc<dyn BatchSink<T>>>, items: Vec<T>) -> usize {
        let count = items.len();
        match sink {
            None if count == 0 => {
                warn!("通道 {} 无待发送消息且未配置 sink", channel);
            }
            None => {
                warn!("未配置 sink，丢弃通道 {} 的 {} 条消息", channel, count);
                self.state.lock().stats.items_discarded += count as u64;
            }
            Some(_) if count == 0 => {
                debug!("通道 {} 无待发送消息", channel);
            }
            Some(sink) => {
                {
                    let mut state = self.state.lock();
                    state.stats.flushes += 1;
                    state.stats.items_flushed += count as u64;
                }
                debug!("合批发送: channel={}, {} 条", channel, count);
                sink.deliver(channel, items);
            }
        }
        count
    }
}

async fn window_timer<T: Send + 'static>(shared: Weak<BatcherShared<T>>, channel: String, window: u64) {
    let interval = match shared.upgrade() {
        Some(shared) => shared.interval,
        None => return,
    };
    tokio::time::sleep(interval).await;
    if let Some(shared) = shared.upgrade() {
        shared.flush_window(&channel, window);
    }
}

enum Outgoing {
    Publish { topic: String, payload: Bytes },
    Barrier(oneshot::Sender<()>),
}

/// 把每次合批结果序列化为 JSON 数组，发布到 `<prefix>/<channel>`
///
/// 发布由单个后台任务按交付顺序逐条完成，同一 sink 的批次不会乱序。
pub struct TransportBatchSink {
    transport: Arc<dyn Transport>,
    prefix: String,
    qos: Qos,
    runtime: Option<Handle>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl TransportBatchSink {
    pub fn new(transport: Arc<dyn Transport>, prefix: impl Into<String>, qos: Qos) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
            qos,
            runtime: Handle::try_current().ok(),
            outbox: Mutex::new(None),
        }
    }

    pub fn topic_for(&self, channel: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), channel)
    }

    /// 等待此前交付的批次全部发布完成（成功或失败）
    pub async fn flushed(&self) {
        let outbox = match self.outbox.lock().clone() {
            Some(outbox) => outbox,
            None => return,
        };
        let (done_tx, done_rx) = oneshot::channel();
        if outbox.send(Outgoing::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn outbox(&self) -> Option<mpsc::UnboundedSender<Outgoing>> {
        let mut outbox = self.outbox.lock();
        if let Some(tx) = outbox.as_ref().filter(|tx| !tx.is_closed()) {
            return Some(tx.clone());
        }

        let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok())?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(publish_worker(self.transport.clone(), self.qos, rx));
        *outbox = Some(tx.clone());
        Some(tx)
    }
}

impl<T: Serialize> BatchSink<T> for TransportBatchSink {
    fn deliver(&self, channel: &str, items: Vec<T>) {
        let payload = match serde_json::to_vec(&items) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("合批序列化失败: channel={}, {}", channel, e);
                return;
            }
        };

        let topic = self.topic_for(channel);
        match self.outbox() {
            Some(outbox) => {
                if outbox.send(Outgoing::Publish { topic, payload }).is_err() {
                    warn!("合批发布队列已关闭: channel={}", channel);
                }
            }
            None => warn!("没有可用的 tokio 运行时，丢弃合批: topic={}", topic),
        }
    }
}

async fn publish_worker(
    transport: Arc<dyn Transport>,
    qos: Qos,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = outbox.recv().await {
        match outgoing {
            Outgoing::Publish { topic, payload } => {
                if let Err(e) = transport.publish(&topic, payload, qos).await {
                    warn!("合批发布失败: topic={}, {}", topic, e);
                }
            }
            Outgoing::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectOptions, MemoryBroker, TransportSignal};
    use serde_json::json;

    type Delivered = Arc<Mutex<Vec<(String, Vec<u32>)>>>;

    fn recording_batcher(interval: Duration) -> (MessageBatcher<u32>, Delivered) {
        let delivered: Delivered = Arc::default();
        let sink = delivered.clone();
        let batcher = MessageBatcher::with_sink(
            interval,
            Arc::new(move |channel: &str, items: Vec<u32>| {
                sink.lock().push((channel.to_string(), items));
            }),
        );
        (batcher, delivered)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_single_flush() {
        let (batcher, delivered) = recording_batcher(Duration::from_millis(100));

        for i in 0..5 {
            batcher.add("gps", i);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert!(delivered.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*delivered.lock(), vec![("gps".to_string(), vec![0, 1, 2, 3, 4])]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(delivered.lock().len(), 1);
        assert_eq!(batcher.stats().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_not_reset_by_adds() {
        let (batcher, delivered) = recording_batcher(Duration::from_millis(100));

        batcher.add("gps", 1);
        tokio::time::sleep(Duration::from_millis(90)).await;
        batcher.add("gps", 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // 第一个窗口在 100ms 时到期，第二条消息随之发出
        assert_eq!(*delivered.lock(), vec![("gps".to_string(), vec![1, 2])]);

        batcher.add("gps", 3);
        assert_eq!(batcher.pending("gps"), 1);
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(delivered.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer() {
        let (batcher, delivered) = recording_batcher(Duration::from_millis(100));

        batcher.add("gps", 1);
        batcher.add("telemetry", 9);
        assert_eq!(batcher.flush("gps"), 1);
        assert_eq!(batcher.flush("gps"), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let delivered = delivered.lock().clone();
        assert_eq!(
            delivered,
            vec![("gps".to_string(), vec![1]), ("telemetry".to_string(), vec![9])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_and_dispose() {
        let (batcher, delivered) = recording_batcher(Duration::from_millis(100));

        batcher.add("a", 1);
        batcher.add("b", 2);
        batcher.add("b", 3);
        assert_eq!(batcher.flush_all(), 3);
        assert_eq!(delivered.lock().len(), 2);

        batcher.add("a", 4);
        batcher.dispose();
        batcher.dispose();
        assert!(batcher.is_disposed());
        assert!(!batcher.add("a", 5));
        assert_eq!(batcher.pending("a"), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(delivered.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_sink_discards() {
        let batcher: MessageBatcher<u32> = MessageBatcher::new(Duration::from_millis(50));
        assert_eq!(batcher.flush("gps"), 0);

        batcher.add("gps", 1);
        batcher.add("gps", 2);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stats = batcher.stats();
        assert_eq!(stats.items_added, 2);
        assert_eq!(stats.items_discarded, 2);
        assert_eq!(stats.flushes, 0);
    }

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            broker_url: "memory://local".to_string(),
            client_id: client_id.to_string(),
            topics: vec!["dispatch/batch/#".to_string()],
            qos: Qos::AtLeastOnce,
            clean_session: true,
            keep_alive_secs: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_sink_publishes_json_array() {
        let broker = MemoryBroker::new();
        let listener = broker.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener_options = options("listener");
        listener.connect(&listener_options, tx).await.unwrap();
        listener
            .subscribe(&listener_options.topics, Qos::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TransportSignal::Connected));

        let publisher = broker.transport();
        let (publisher_tx, _publisher_rx) = mpsc::unbounded_channel();
        publisher
            .connect(&options("publisher"), publisher_tx)
            .await
            .unwrap();

        let sink = TransportBatchSink::new(Arc::new(publisher), "dispatch/batch/", Qos::AtLeastOnce);
        assert_eq!(sink.topic_for("gps"), "dispatch/batch/gps");

        let batcher = MessageBatcher::with_sink(Duration::from_millis(100), Arc::new(sink));
        batcher.add("gps", json!({"driver": "d-1", "lat": 1.5}));
        batcher.add("gps", json!({"driver": "d-2", "lat": 2.5}));

        match rx.recv().await {
            Some(TransportSignal::Message { topic, payload }) => {
                assert_eq!(topic, "dispatch/batch/gps");
                let items: Vec<serde_json::Value> = serde_json::from_slice(&payload).unwrap();
                assert_eq!(items.len(), 2);
                assert_eq!(items[1]["driver"], "d-2");
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_from_thread_outside_runtime() {
        let (batcher, delivered) = recording_batcher(Duration::from_millis(20));

        let producer = batcher.clone();
        std::thread::spawn(move || {
            for i in 0..3 {
                assert!(producer.add("gps", i));
            }
        })
        .join()
        .unwrap();

        for _ in 0..100 {
            if !delivered.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*delivered.lock(), vec![("gps".to_string(), vec![0, 1, 2])]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transport_sink_keeps_batch_order() {
        let broker = MemoryBroker::new();
        let listener = broker.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener_options = options("listener");
        listener.connect(&listener_options, tx).await.unwrap();
        listener
            .subscribe(&listener_options.topics, Qos::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TransportSignal::Connected));

        let publisher = broker.transport();
        let (publisher_tx, _publisher_rx) = mpsc::unbounded_channel();
        publisher
            .connect(&options("publisher"), publisher_tx)
            .await
            .unwrap();

        let sink = Arc::new(TransportBatchSink::new(
            Arc::new(publisher),
            "dispatch/batch",
            Qos::AtLeastOnce,
        ));
        let batcher: MessageBatcher<u32> =
            MessageBatcher::with_sink(Duration::from_secs(60), sink.clone());
        for seq in 0..20 {
            batcher.add("gps", seq);
            assert_eq!(batcher.flush("gps"), 1);
        }
        sink.flushed().await;

        let mut received = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let TransportSignal::Message { payload, .. } = signal {
                let items: Vec<u32> = serde_json::from_slice(&payload).unwrap();
                received.extend(items);
            }
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }
}
