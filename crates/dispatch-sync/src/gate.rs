//! 门控队列（gated queue）
//!
//! "未就绪先缓冲、就绪后一次性按时间顺序放行"的统一原语：
//! 有界队列 + 调用方提供的就绪判定 + 一次性放行。
//!
//! 系统中有两道相互独立的就绪门：
//! - 传输层就绪（[`TransportGate`]，连接管理器进入 `Ready`）
//! - 应用层就绪（[`FlagGate`]，应用自身的初始化完成）
//!
//! 连接管理器用 `GatedQueue` + `TransportGate` 缓冲入站消息；
//! 面向界面的消费者用 [`GatedConsumer`] + [`AllOf`] 同时满足两道门。

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::buffer::BoundedBuffer;
use crate::connection_state::ConnectionState;
use crate::event::Timestamped;
use crate::utils::{now_millis, Timestamp};

/// 就绪判定
pub trait ReadyGate: Send + Sync {
    fn is_ready(&self) -> bool;

    fn name(&self) -> String {
        "gate".to_string()
    }
}

impl<G: ReadyGate + ?Sized> ReadyGate for Arc<G> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// 应用层就绪标志
#[derive(Debug, Clone)]
pub struct FlagGate {
    name: String,
    flag: Arc<watch::Sender<bool>>,
}

impl FlagGate {
    pub fn new(name: impl Into<String>) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            name: name.into(),
            flag: Arc::new(flag),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        let changed = self.flag.send_replace(ready) != ready;
        if changed {
            debug!("就绪门 {} -> {}", self.name, ready);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

impl ReadyGate for FlagGate {
    fn is_ready(&self) -> bool {
        *self.flag.borrow()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// 传输层就绪：连接管理器处于 `Ready`
#[derive(Debug, Clone)]
pub struct TransportGate {
    state: watch::Receiver<ConnectionState>,
}

impl TransportGate {
    pub fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 等待传输层进入 `Ready`
    pub async fn wait_ready(&mut self) -> bool {
        self.state.wait_for(|state| state.is_steady()).await.is_ok()
    }
}

impl ReadyGate for TransportGate {
    fn is_ready(&self) -> bool {
        self.state.borrow().is_steady()
    }

    fn name(&self) -> String {
        "transport".to_string()
    }
}

/// 组合门：两道门都就绪才算就绪
#[derive(Debug, Clone)]
pub struct AllOf<A, B>(pub A, pub B);

impl<A: ReadyGate, B: ReadyGate> ReadyGate for AllOf<A, B> {
    fn is_ready(&self) -> bool {
        self.0.is_ready() && self.1.is_ready()
    }

    fn name(&self) -> String {
        format!("{}+{}", self.0.name(), self.1.name())
    }
}

/// 入队结果
#[derive(Debug, PartialEq)]
pub enum Admission<T> {
    /// 门已打开，直接放行
    Pass(T),
    /// 已缓冲；若超出容量，附带被淘汰的最早元素
    Buffered { evicted: Option<T> },
}

/// 门控队列
#[derive(Debug)]
pub struct GatedQueue<T, G> {
    buffer: BoundedBuffer<T>,
    gate: G,
    /// 一次性放行标志；门关闭期间有新元素入队时重新上膛
    released: bool,
}

impl<T: Timestamped, G: ReadyGate> GatedQueue<T, G> {
    pub fn new(capacity: usize, gate: G) -> Self {
        Self {
            buffer: BoundedBuffer::new(capacity),
            gate,
            released: false,
        }
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    pub fn is_open(&self) -> bool {
        self.gate.is_ready()
    }

    /// 门打开且没有积压时放行，否则缓冲
    pub fn admit(&mut self, item: T) -> Admission<T> {
        if self.gate.is_ready() && self.buffer.is_empty() {
            return Admission::Pass(item);
        }
        Admission::Buffered {
            evicted: self.hold(item),
        }
    }

    /// 无条件缓冲
    pub fn hold(&mut self, item: T) -> Option<T> {
        self.released = false;
        let evicted = self.buffer.push(item);
        if evicted.is_some() {
            warn!(
                "门控队列 {} 已满（容量 {}），淘汰最早的消息",
                self.gate.name(),
                self.buffer.capacity()
            );
        }
        evicted
    }

    /// 一次性放行：门打开且本轮尚未放行时，按时间戳升序取出全部积压
    pub fn release(&mut self) -> Option<Vec<T>> {
        if self.released || !self.gate.is_ready() {
            return None;
        }
        self.released = true;
        Some(self.drain_sorted())
    }

    /// 不看门，按 (时间戳, 序号) 升序取出全部积压
    pub fn drain_sorted(&mut self) -> Vec<T> {
        let mut items = self.buffer.drain();
        items.sort_by_key(|item| (item.timestamp(), item.sequence()));
        items
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn evicted(&self) -> u64 {
        self.buffer.evicted()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.released = false;
    }
}

/// 带到达时间戳的消息，用于本身不携带时间的消息类型
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub timestamp: Timestamp,
}

impl<T> Stamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            value,
            timestamp: now_millis(),
        }
    }

    pub fn at(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

impl<T> Timestamped for Stamped<T> {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// 门控消费者统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatedConsumerStats {
    pub buffered: u64,
    pub applied: u64,
    pub flushes: u64,
    pub evicted: u64,
}

/// 门控消费者适配器
///
/// 门关闭时缓冲，门打开后每个"变为就绪"的转换恰好放行一次。
pub struct GatedConsumer<T, G, F>
where
    F: FnMut(T),
{
    queue: GatedQueue<T, G>,
    apply: F,
    stats: GatedConsumerStats,
}

impl<T, G, F> GatedConsumer<T, G, F>
where
    T: Timestamped,
    G: ReadyGate,
    F: FnMut(T),
{
    pub fn new(capacity: usize, gate: G, apply: F) -> Self {
        Self {
            queue: GatedQueue::new(capacity, gate),
            apply,
            stats: GatedConsumerStats::default(),
        }
    }

    /// 门关闭时缓冲，否则立即应用
    ///
    /// 门已打开但仍有积压时，先放行积压再应用本条，保证时间顺序。
    pub fn process_or_buffer(&mut self, msg: T) {
        if self.queue.is_open() && !self.queue.is_empty() {
            self.flush_buffer();
        }

        match self.queue.admit(msg) {
            Admission::Pass(msg) => {
                (self.apply)(msg);
                self.stats.applied += 1;
            }
            Admission::Buffered { evicted } => {
                self.stats.buffered += 1;
                if evicted.is_some() {
                    self.stats.evicted += 1;
                }
            }
        }
    }

    /// 放行积压（每次就绪转换只执行一次）
    ///
    /// 返回本次应用的消息数。
    pub fn flush_buffer(&mut self) -> usize {
        let Some(items) = self.queue.release() else {
            return 0;
        };

        let count = items.len();
        for item in items {
            (self.apply)(item);
        }
        self.stats.applied += count as u64;
        self.stats.flushes += 1;
        debug!("门控消费者放行 {} 条积压消息", count);
        count
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_ready(&self) -> bool {
        self.queue.is_open()
    }

    pub fn stats(&self) -> GatedConsumerStats {
        self.stats.clone()
    }
}
