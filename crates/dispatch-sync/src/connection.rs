//! 连接管理器
//!
//! 负责传输层的生命周期和连接状态机：
//! - 非稳态期间缓冲入站消息（有界，超出淘汰最早的）
//! - 稳态下去重后直接交给同步协调器
//! - `start_sync` 时按同步窗口回放缓冲
//! - 断线后按指数退避重连，次数耗尽后进入终态
//!
//! 所有可变状态都在一把 `parking_lot::Mutex` 之后，持锁期间不会 `.await`。
//! 输出是一条有序的 [`ConnectionEvent`] 流，由同步协调器单任务消费。

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::buffer::BufferedMessage;
use crate::config::ConnectionConfig;
use crate::connection_state::{ConnectionState, StateMachine};
use crate::dedup::DedupRecord;
use crate::error::{Result, SyncError};
use crate::event::{Entity, Event};
use crate::gate::{Admission, GatedQueue, TransportGate};
use crate::normalizer::Normalizer;
use crate::stats::SharedStats;
use crate::transport::{Transport, TransportSignal};
use crate::utils::{now_millis, Timestamp};

/// 一次初始同步的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// 回放并应用的缓冲消息数
    pub applied: usize,
    pub duplicates: usize,
    /// 落在同步窗口外被丢弃的消息数
    pub discarded: usize,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub duration_ms: u64,
}

/// 连接管理器的输出事件
///
/// `epoch` 在每次 `disconnect()` 时递增，消费方据此丢弃过期事件。
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
        epoch: u64,
    },
    /// 需要拉取初始快照
    InitialDataRequired { epoch: u64 },
    /// 应用一条事件
    Apply { epoch: u64, event: Event },
    /// 初始同步完成
    SyncCompleted { epoch: u64, report: SyncReport },
    /// 已同步过的会话重连成功，缓冲已回放
    Resynced { epoch: u64 },
    MaxReconnectAttemptsReached { attempts: u32 },
    Error(SyncError),
}

struct Inner {
    machine: StateMachine,
    queue: GatedQueue<BufferedMessage, TransportGate>,
    dedup: DedupRecord,
    backoff: ReconnectBackoff,
    /// 当前会话是否完成过初始同步
    has_synced: bool,
    epoch: u64,
    /// 传输连接代数；旧连接的迟到信号按此丢弃
    link: u64,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_scheduled: bool,
    connecting: bool,
    /// 重连已耗尽；只有 `connect()` / `disconnect()` 能解除
    exhausted: bool,
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    normalizer: Arc<dyn Normalizer>,
    stats: SharedStats,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    inner: Mutex<Inner>,
}

/// 连接管理器
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.shared.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        normalizer: Arc<dyn Normalizer>,
        stats: SharedStats,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let machine = StateMachine::new();
        let gate = TransportGate::new(machine.subscribe());

        let inner = Inner {
            queue: GatedQueue::new(config.buffer_capacity, gate),
            dedup: DedupRecord::new(config.dedup_capacity),
            backoff: ReconnectBackoff::new(config.reconnect.clone()),
            machine,
            has_synced: false,
            epoch: 0,
            link: 0,
            cancel: CancellationToken::new(),
            pump: None,
            reconnect_timer: None,
            reconnect_scheduled: false,
            connecting: false,
            exhausted: false,
        };

        let manager = Self {
            shared: Arc::new(Shared {
                config,
                transport,
                normalizer,
                stats,
                events,
                inner: Mutex::new(inner),
            }),
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().machine.current()
    }

    pub fn epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.inner.lock().machine.subscribe()
    }

    /// 传输层就绪门（供门控消费者组合使用）
    pub fn transport_gate(&self) -> TransportGate {
        TransportGate::new(self.subscribe_state())
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn dedup_len(&self) -> usize {
        self.shared.inner.lock().dedup.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().backoff.attempts()
    }

    /// 是否有待触发的重连定时器
    pub fn reconnect_pending(&self) -> bool {
        self.shared.inner.lock().reconnect_scheduled
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    /// 建立连接
    ///
    /// 只能在 `Disconnected` 或 `Error`（重连耗尽后的手动恢复）状态下调用。
    pub async fn connect(&self) -> Result<()> {
        let (link, signals) = {
            let mut inner = self.shared.inner.lock();
            let current = inner.machine.current();
            if !matches!(current, ConnectionState::Disconnected | ConnectionState::Error) {
                return Err(SyncError::InvalidOperation(format!(
                    "connect() called in state {}",
                    current
                )));
            }

            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.reconnect_scheduled = false;
            inner.exhausted = false;
            inner.backoff.reset();
            self.transition(&mut inner, ConnectionState::Connecting)?;
            self.begin_link(&mut inner)
        };

        self.shared.stats.record_connection_attempt();
        info!("连接 broker: {}", self.shared.config.broker_url);

        match self.open_link(signals).await {
            Ok(()) => self.on_link_established(link).await,
            Err(e) => {
                self.on_link_failed(link, e.clone());
                Err(e)
            }
        }
    }

    /// 用快照完成初始同步
    ///
    /// 只能在 `LoadingInitial` 状态下调用。同步窗口为 `[snapshot_ts, now)`：
    /// 窗口内的缓冲消息去重后按 (时间戳, 序号) 顺序应用，其余丢弃。
    pub fn start_sync(&self, snapshot: &[Entity], snapshot_ts: Timestamp) -> Result<SyncReport> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        let current = inner.machine.current();
        if current != ConnectionState::LoadingInitial {
            return Err(SyncError::InvalidOperation(format!(
                "start_sync() called in state {}",
                current
            )));
        }

        let started = Instant::now();
        self.transition(inner, ConnectionState::Syncing)?;

        let window_end = now_millis();
        inner.dedup.seed_snapshot(snapshot);

        let mut report = SyncReport {
            window_start: snapshot_ts,
            window_end,
            ..Default::default()
        };

        for buffered in inner.queue.drain_sorted() {
            if buffered.timestamp < snapshot_ts || buffered.timestamp >= window_end {
                debug!(
                    "丢弃同步窗口外的消息: topic={}, id={}, timestamp={}",
                    buffered.topic, buffered.message.id, buffered.timestamp
                );
                report.discarded += 1;
                continue;
            }
            if inner.dedup.is_duplicate(&buffered.message) {
                report.duplicates += 1;
                continue;
            }

            inner.dedup.record(&buffered.message);
            self.emit(ConnectionEvent::Apply {
                epoch: inner.epoch,
                event: buffered.message,
            });
            report.applied += 1;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.shared.stats.record_discarded(report.discarded as u64);
        self.shared.stats.record_duplicates(report.duplicates as u64);
        self.shared.stats.record_sync(window_end, report.duration_ms);

        inner.has_synced = true;
        self.transition(inner, ConnectionState::Ready)?;
        info!(
            "初始同步完成: 快照 {} 条, 回放 {} 条, 去重 {} 条, 丢弃 {} 条, 耗时 {}ms",
            snapshot.len(),
            report.applied,
            report.duplicates,
            report.discarded,
            report.duration_ms
        );

        self.emit(ConnectionEvent::SyncCompleted {
            epoch: inner.epoch,
            report: report.clone(),
        });
        Ok(report)
    }

    /// 断开连接
    ///
    /// 任意状态下都可以调用：取消所有定时器和信号泵，清空缓冲和去重记录。
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.link += 1;
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.reconnect_scheduled = false;
            inner.connecting = false;
            inner.exhausted = false;
            inner.queue.clear();
            inner.dedup.clear();
            inner.backoff.reset();
            inner.has_synced = false;
            self.transition(&mut inner, ConnectionState::Disconnected)?;
        }

        info!("已断开连接");
        self.shared.transport.disconnect().await
    }

    /// 直通发布
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.shared
            .transport
            .publish(topic, payload.into(), self.shared.config.qos)
            .await
    }

    fn emit(&self, event: ConnectionEvent) {
        // 接收端已关闭说明协调器已停止，事件无人关心
        let _ = self.shared.events.send(event);
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) -> Result<()> {
        if let Some(old) = inner.machine.transition(next)? {
            self.emit(ConnectionEvent::StateChanged {
                old,
                new: next,
                epoch: inner.epoch,
            });
        }
        Ok(())
    }

    /// 开启新的传输连接代：新的信号通道和信号泵
    fn begin_link(&self, inner: &mut Inner) -> (u64, mpsc::UnboundedSender<TransportSignal>) {
        inner.link += 1;
        inner.connecting = true;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link = inner.link;
        let cancel = inner.cancel.clone();
        let weak = Arc::downgrade(&self.shared);
        inner.pump = Some(tokio::spawn(signal_pump(weak, link, rx, cancel)));
        (link, tx)
    }

    async fn open_link(&self, signals: mpsc::UnboundedSender<TransportSignal>) -> Result<()> {
        let config = &self.shared.config;
        let options = config.connect_options();
        let timeout = config.connect_timeout();

        tokio::time::timeout(timeout, self.shared.transport.connect(&options, signals))
            .await
            .map_err(|_| {
                SyncError::Timeout(format!(
                    "connect to {} timed out after {}ms",
                    config.broker_url, config.connect_timeout_ms
                ))
            })??;

        tokio::time::timeout(
            timeout,
            self.shared.transport.subscribe(&options.topics, options.qos),
        )
        .await
        .map_err(|_| {
            SyncError::Timeout(format!(
                "subscribe timed out after {}ms",
                config.connect_timeout_ms
            ))
        })??;

        debug!("已订阅 {} 个 topic", options.topics.len());
        Ok(())
    }

    async fn on_link_established(&self, link: u64) -> Result<()> {
        let established = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.link != link {
                false
            } else {
                inner.connecting = false;
                inner.backoff.reset();
                self.enter_connected(inner)?;
                true
            }
        };

        if established {
            Ok(())
        } else {
            // 连接期间被 disconnect()，关闭刚建立的连接
            warn!("连接建立时会话已结束，关闭传输");
            let _ = self.shared.transport.disconnect().await;
            Err(SyncError::Cancelled("disconnected while connecting".into()))
        }
    }

    /// 传输层连上之后的状态推进
    fn enter_connected(&self, inner: &mut Inner) -> Result<()> {
        let current = inner.machine.current();
        if inner.has_synced && current == ConnectionState::Reconnecting {
            self.replay_after_reconnect(inner)?;
            return Ok(());
        }

        self.transition(inner, ConnectionState::LoadingInitial)?;
        info!("传输层已连接，等待初始快照（缓冲 {} 条）", inner.queue.len());
        self.emit(ConnectionEvent::InitialDataRequired { epoch: inner.epoch });
        Ok(())
    }

    /// 重连成功：缓冲经去重后按顺序回放，回到稳态
    fn replay_after_reconnect(&self, inner: &mut Inner) -> Result<()> {
        let mut applied = 0usize;
        let mut duplicates = 0u64;
        for buffered in inner.queue.drain_sorted() {
            if inner.dedup.is_duplicate(&buffered.message) {
                duplicates += 1;
                continue;
            }
            inner.dedup.record(&buffered.message);
            self.emit(ConnectionEvent::Apply {
                epoch: inner.epoch,
                event: buffered.message,
            });
            applied += 1;
        }
        self.shared
            .stats
            .update(|stats| stats.duplicates_filtered += duplicates);

        self.transition(inner, ConnectionState::Ready)?;
        info!("重连成功，回放 {} 条, 去重 {} 条", applied, duplicates);
        self.emit(ConnectionEvent::Resynced { epoch: inner.epoch });
        Ok(())
    }

    fn on_link_failed(&self, link: u64, error: SyncError) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link {
            return;
        }
        inner.connecting = false;

        warn!("连接失败: {}", error);
        self.emit(ConnectionEvent::Error(error));

        if inner.machine.current() != ConnectionState::Reconnecting {
            if let Err(e) = self.transition(inner, ConnectionState::Error) {
                warn!("{}", e);
            }
        }
        self.schedule_reconnect(inner);
    }

    fn schedule_reconnect(&self, inner: &mut Inner) {
        if inner.reconnect_scheduled || inner.connecting || inner.exhausted {
            return;
        }
        if inner.backoff.is_exhausted() {
            self.give_up(inner);
            return;
        }

        let delay = inner.backoff.current_delay();
        let epoch = inner.epoch;
        let cancel = inner.cancel.clone();
        let weak = Arc::downgrade(&self.shared);

        info!(
            "{}ms 后重连（第 {}/{} 次）",
            delay.as_millis(),
            inner.backoff.attempts() + 1,
            inner.backoff.max_attempts()
        );
        inner.reconnect_scheduled = true;
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(shared) = weak.upgrade() {
                        ConnectionManager { shared }.attempt_reconnect(epoch).await;
                    }
                }
            }
        }));
    }

    async fn attempt_reconnect(&self, epoch: u64) {
        let (link, signals) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            inner.reconnect_scheduled = false;
            // 定时器属于已结束的会话
            if inner.epoch != epoch {
                return;
            }
            match inner.machine.current() {
                ConnectionState::Reconnecting | ConnectionState::Error => {}
                other => {
                    debug!("状态已变为 {}，放弃本次重连", other);
                    return;
                }
            }
            if inner.backoff.is_exhausted() {
                self.give_up(inner);
                return;
            }

            inner.backoff.record_attempt();
            if let Err(e) = self.transition(inner, ConnectionState::Reconnecting) {
                warn!("{}", e);
                return;
            }
            self.begin_link(inner)
        };

        self.shared.stats.record_reconnect_attempt();
        self.shared.stats.record_connection_attempt();

        match self.open_link(signals).await {
            Ok(()) => {
                if let Err(e) = self.on_link_established(link).await {
                    debug!("重连结果已作废: {}", e);
                }
            }
            Err(e) => self.on_link_failed(link, e),
        }
    }

    /// 重连次数耗尽：进入终态，不再自动重连
    fn give_up(&self, inner: &mut Inner) {
        if inner.exhausted {
            return;
        }
        inner.exhausted = true;
        let attempts = inner.backoff.attempts();
        error!("重连次数已耗尽（{} 次），停止自动重连", attempts);

        if let Err(e) = self.transition(inner, ConnectionState::Error) {
            warn!("{}", e);
        }
        self.emit(ConnectionEvent::MaxReconnectAttemptsReached { attempts });
    }

    fn handle_signal(&self, link: u64, signal: TransportSignal) {
        match signal {
            TransportSignal::Message { topic, payload } => {
                let event = match self
                    .shared
                    .normalizer
                    .normalize(&topic, &payload, now_millis())
                {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("丢弃无法解析的消息: {}", e);
                        self.shared.stats.record_parse_error();
                        self.emit(ConnectionEvent::Error(e.into()));
                        return;
                    }
                };
                self.on_message(link, event);
            }
            TransportSignal::Connected => self.on_transport_connected(link),
            TransportSignal::Reconnect => self.on_transport_reconnect(link),
            TransportSignal::Closed { reason } => self.on_transport_closed(link, &reason),
            TransportSignal::Error(reason) => self.on_transport_error(link, reason),
        }
    }

    fn on_message(&self, link: u64, event: Event) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link {
            return;
        }
        if inner.machine.current() == ConnectionState::Disconnected {
            debug!("未连接，忽略消息: {}", event.topic);
            return;
        }

        match inner.queue.admit(BufferedMessage::new(event)) {
            Admission::Pass(buffered) => {
                if inner.dedup.is_duplicate(&buffered.message) {
                    self.shared.stats.record_duplicate();
                    return;
                }
                inner.dedup.record(&buffered.message);
                self.emit(ConnectionEvent::Apply {
                    epoch: inner.epoch,
                    event: buffered.message,
                });
            }
            Admission::Buffered { evicted } => {
                self.shared.stats.record_queued();
                debug!(
                    "状态 {} 下缓冲消息（{} 条）",
                    inner.machine.current(),
                    inner.queue.len()
                );
                if let Some(oldest) = evicted {
                    self.shared.stats.record_overflow();
                    self.emit(ConnectionEvent::Error(SyncError::BufferOverflow {
                        topic: oldest.topic,
                        capacity: inner.queue.capacity(),
                    }));
                }
            }
        }
    }

    /// 客户端库自行重连成功
    fn on_transport_connected(&self, link: u64) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link || inner.connecting {
            return;
        }
        if inner.machine.current() != ConnectionState::Reconnecting {
            return;
        }

        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.reconnect_scheduled = false;
        inner.backoff.reset();
        if let Err(e) = self.enter_connected(inner) {
            warn!("{}", e);
        }
    }

    /// 客户端库发起重连，同样计入重连次数
    fn on_transport_reconnect(&self, link: u64) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link {
            return;
        }
        if inner.exhausted || inner.machine.current() == ConnectionState::Disconnected {
            return;
        }

        inner.backoff.record_attempt();
        self.shared.stats.record_reconnect_attempt();
        if inner.backoff.is_exhausted() {
            self.give_up(inner);
            return;
        }

        if inner.machine.current() != ConnectionState::Reconnecting {
            if let Err(e) = self.transition(inner, ConnectionState::Reconnecting) {
                warn!("{}", e);
            }
        }
    }

    fn on_transport_closed(&self, link: u64, reason: &str) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link || inner.connecting {
            return;
        }

        let current = inner.machine.current();
        warn!("传输连接关闭（{}）: {}", current, reason);
        match current {
            ConnectionState::Disconnected => return,
            ConnectionState::Ready | ConnectionState::LoadingInitial => {
                if let Err(e) = self.transition(inner, ConnectionState::Reconnecting) {
                    warn!("{}", e);
                }
            }
            ConnectionState::Reconnecting | ConnectionState::Error => {}
            ConnectionState::Connecting | ConnectionState::Syncing => {
                if let Err(e) = self.transition(inner, ConnectionState::Error) {
                    warn!("{}", e);
                }
            }
        }
        self.schedule_reconnect(inner);
    }

    fn on_transport_error(&self, link: u64, reason: String) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.link != link {
            return;
        }

        warn!("传输层错误: {}", reason);
        self.emit(ConnectionEvent::Error(SyncError::Transport(reason)));

        // 正在进行的连接尝试会自行决定结果
        if inner.connecting || inner.exhausted {
            return;
        }
        match inner.machine.current() {
            ConnectionState::Disconnected => return,
            ConnectionState::Reconnecting => {}
            _ => {
                if let Err(e) = self.transition(inner, ConnectionState::Error) {
                    warn!("{}", e);
                }
            }
        }
        self.schedule_reconnect(inner);
    }
}

/// 信号泵：把某一连接代的传输信号逐条交给连接管理器
async fn signal_pump(
    shared: Weak<Shared>,
    link: u64,
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                let Some(signal) = signal else { break };
                let Some(shared) = shared.upgrade() else { break };
                ConnectionManager { shared }.handle_signal(link, signal);
            }
        }
    }
    debug!("信号泵退出: link={}", link);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectConfig;
    use crate::normalizer::DefaultNormalizer;
    use crate::transport::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    const CLIENT: &str = "test-client";

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            client_id: CLIENT.to_string(),
            buffer_capacity: 100,
            dedup_capacity: 100,
            reconnect: ReconnectConfig {
                base_delay_ms: 10,
                max_delay_ms: 40,
                max_attempts: 3,
            },
            ..Default::default()
        }
    }

    fn manager(
        broker: &MemoryBroker,
        config: ConnectionConfig,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>, SharedStats) {
        let stats = SharedStats::new();
        let (manager, rx) = ConnectionManager::new(
            config,
            Arc::new(broker.transport()),
            Arc::new(DefaultNormalizer::default()),
            stats.clone(),
        );
        (manager, rx, stats)
    }

    fn update(id: &str, ts: Timestamp, driver: &str) -> String {
        json!({"id": id, "timestamp": ts, "driver": driver}).to_string()
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not met in time");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn applied_ids(events: &[ConnectionEvent]) -> Vec<(String, Timestamp)> {
        events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Apply { event, .. } => Some((event.id.clone(), event.timestamp)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_requests_initial_data() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::LoadingInitial);
        assert_eq!(stats.snapshot().connection_attempts, 1);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::InitialDataRequired { epoch: 0 })));

        // 已连接时再次 connect 被拒绝
        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
    }

    #[tokio::test]
    async fn test_start_sync_replays_window_in_order() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());
        manager.connect().await.unwrap();

        let snapshot_ts = now_millis() - 1_000;
        broker.publish("dispatch/orders/update", update("1", snapshot_ts - 10, "old"));
        broker.publish("dispatch/orders/update", update("2", snapshot_ts + 20, "b"));
        broker.publish("dispatch/orders/update", update("3", snapshot_ts + 10, "a"));
        broker.publish("dispatch/orders/update", update("4", now_millis() + 60_000, "future"));
        eventually(|| manager.buffered_len() == 4).await;
        assert_eq!(stats.snapshot().messages_queued, 4);

        // 实体 2 在快照中恰好是该版本：视为已体现
        let snapshot = vec![Entity::new("2", snapshot_ts + 20)];
        let report = manager.start_sync(&snapshot, snapshot_ts).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.discarded, 2);
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.buffered_len(), 0);

        let events = drain(&mut rx);
        assert_eq!(applied_ids(&events), vec![("3".to_string(), snapshot_ts + 10)]);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::SyncCompleted { report, .. } if report.applied == 1)));

        let stats = stats.snapshot();
        assert_eq!(stats.messages_discarded, 2);
        assert!(stats.last_sync_time.is_some());

        // 第二次 start_sync 非法
        assert!(manager.start_sync(&[], now_millis()).is_err());
    }

    #[tokio::test]
    async fn test_steady_state_dedup() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());
        manager.connect().await.unwrap();
        manager.start_sync(&[], now_millis()).unwrap();
        drain(&mut rx);

        let ts = now_millis();
        broker.publish("dispatch/orders/update", update("5", ts, "d-1"));
        broker.publish("dispatch/orders/update", update("5", ts, "d-1"));
        eventually(|| stats.snapshot().duplicates_filtered == 1).await;

        let events = drain(&mut rx);
        assert_eq!(applied_ids(&events), vec![("5".to_string(), ts)]);
    }

    #[tokio::test]
    async fn test_buffer_overflow_evicts_oldest() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(
            &broker,
            ConnectionConfig {
                buffer_capacity: 2,
                ..config()
            },
        );
        manager.connect().await.unwrap();

        for i in 0..3 {
            broker.publish("dispatch/orders/new", update(&i.to_string(), now_millis(), "x"));
        }
        eventually(|| stats.snapshot().messages_queued == 3).await;

        assert_eq!(manager.buffered_len(), 2);
        assert_eq!(stats.snapshot().buffer_overflows, 1);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ConnectionEvent::Error(SyncError::BufferOverflow { capacity: 2, .. })
        )));
    }

    #[tokio::test]
    async fn test_parse_error_is_isolated() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());
        manager.connect().await.unwrap();

        broker.publish("dispatch/orders/status", json!({"id": "1"}).to_string());
        broker.publish("dispatch/orders/update", "{not json");
        broker.publish("dispatch/orders/update", update("1", now_millis(), "ok"));
        eventually(|| manager.buffered_len() == 1).await;

        assert_eq!(stats.snapshot().parse_errors, 2);
        assert_eq!(manager.state(), ConnectionState::LoadingInitial);
        let parse_errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::Error(SyncError::Parse(_))))
            .count();
        assert_eq!(parse_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_schedules_reconnect() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let (manager, mut rx, stats) = manager(&broker, config());

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(manager.reconnect_pending());

        eventually(|| manager.state() == ConnectionState::LoadingInitial).await;
        assert_eq!(stats.snapshot().reconnect_attempts, 1);
        assert_eq!(manager.reconnect_attempts(), 0);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::InitialDataRequired { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_terminal() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, _stats) = manager(&broker, config());
        manager.connect().await.unwrap();
        manager.start_sync(&[], now_millis()).unwrap();

        broker.set_refuse_connections(true);
        broker.drop_client(CLIENT, "network down");

        eventually(|| manager.state() == ConnectionState::Error).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(manager.reconnect_attempts(), 3);
        assert!(!manager.reconnect_pending());
        let terminal = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::MaxReconnectAttemptsReached { attempts: 3 }))
            .count();
        assert_eq!(terminal, 1);

        // 手动恢复
        broker.set_refuse_connections(false);
        manager.connect().await.unwrap();
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_reported_once_per_session() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());
        manager.connect().await.unwrap();
        manager.start_sync(&[], now_millis()).unwrap();

        for _ in 0..3 {
            assert!(broker.signal(CLIENT, TransportSignal::Reconnect));
        }
        eventually(|| manager.state() == ConnectionState::Error).await;

        // 耗尽后同一连接上的迟到信号
        assert!(broker.signal(CLIENT, TransportSignal::Reconnect));
        assert!(broker.signal(CLIENT, TransportSignal::Error("late failure".into())));
        assert!(broker.signal(
            CLIENT,
            TransportSignal::Closed {
                reason: "late close".into()
            }
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(!manager.reconnect_pending());
        assert_eq!(stats.snapshot().reconnect_attempts, 3);
        let terminal = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::MaxReconnectAttemptsReached { .. }))
            .count();
        assert_eq!(terminal, 1);

        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::LoadingInitial);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_sync_drains_buffer() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, _stats) = manager(&broker, config());
        manager.connect().await.unwrap();
        manager.start_sync(&[], now_millis()).unwrap();

        let ts = now_millis();
        broker.publish("dispatch/orders/update", update("5", ts, "d-1"));
        eventually(|| manager.dedup_len() == 1).await;

        broker.drop_client(CLIENT, "blip");
        // 离线期间：一条重复、一条新消息，由持久会话补投
        broker.publish("dispatch/orders/update", update("5", ts, "d-1"));
        broker.publish("dispatch/orders/update", update("6", ts + 1, "d-2"));

        eventually(|| manager.state() == ConnectionState::Ready && manager.dedup_len() == 2).await;

        let events = drain(&mut rx);
        assert_eq!(
            applied_ids(&events),
            vec![("5".to_string(), ts), ("6".to_string(), ts + 1)]
        );
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::Resynced { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, stats) = manager(&broker, config());
        manager.connect().await.unwrap();

        broker.set_refuse_connections(true);
        broker.drop_client(CLIENT, "gone");
        eventually(|| manager.reconnect_pending()).await;

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.epoch(), 1);
        assert!(!manager.reconnect_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(stats.snapshot().reconnect_attempts, 0);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StateChanged { new: ConnectionState::Reconnecting, epoch: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_moves_to_error() {
        let broker = MemoryBroker::new();
        let (manager, mut rx, _stats) = manager(&broker, config());
        manager.connect().await.unwrap();
        manager.start_sync(&[], now_millis()).unwrap();

        broker.set_refuse_connections(true);
        assert!(broker.signal(CLIENT, TransportSignal::Error("protocol violation".into())));
        eventually(|| manager.state() == ConnectionState::Error).await;
        assert!(manager.reconnect_pending());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Error(SyncError::Transport(_)))));

        // 重连失败期间保持 Reconnecting
        eventually(|| manager.state() == ConnectionState::Reconnecting).await;
        assert_eq!(manager.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_secs(60)));
        let (manager, _rx, _stats) = manager(
            &broker,
            ConnectionConfig {
                connect_timeout_ms: 100,
                ..config()
            },
        );

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(manager.state(), ConnectionState::Error);
    }
}
