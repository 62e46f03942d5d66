//! 同步协调器
//!
//! 编排 "快照拉取 → 缓冲回放 → 稳态应用"，持有规范实体映射（消费方唯一的数据来源）。
//!
//! 所有对映射的修改都发生在一个驱动任务里：它按顺序消费连接管理器的
//! [`ConnectionEvent`] 流，以及快照 / 增量拉取任务回送的结果（`biased`，连接事件优先）。
//! 每条输入都带有连接纪元（epoch），`disconnect()` 之前的迟到结果一律丢弃；
//! 纪元在持有映射写锁时复查，`disconnect()` 清空映射之后不会再有写入。

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::FetchRetryPolicy;
use crate::batcher::{MessageBatcher, TransportBatchSink};
use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::connection_state::ConnectionState;
use crate::error::{Result, SyncError};
use crate::event::{Change, Entity, Event};
use crate::events::{
    event_builders, EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent,
    SyncObserver,
};
use crate::gate::TransportGate;
use crate::normalizer::{DefaultNormalizer, Normalizer};
use crate::source::{DeltaRecord, SnapshotSource};
use crate::stats::{SharedStats, SyncStats};
use crate::transport::Transport;
use crate::utils::{now_millis, Timestamp};

/// 拉取任务回送给驱动任务的结果
#[derive(Debug)]
enum Command {
    SnapshotFetched {
        epoch: u64,
        generation: u64,
        entities: Vec<Entity>,
        snapshot_ts: Timestamp,
    },
    SnapshotFailed {
        epoch: u64,
        generation: u64,
        attempts: u32,
        error: SyncError,
    },
    DeltaFetched {
        epoch: u64,
        records: Option<Vec<DeltaRecord>>,
    },
}

enum Input {
    Connection(ConnectionEvent),
    Command(Command),
}

#[derive(Default)]
struct Control {
    driver: Option<JoinHandle<()>>,
    fetch: Option<JoinHandle<()>>,
    /// 快照拉取代数；只接受最新一次拉取的结果
    fetch_generation: u64,
    /// 快照已载入、缓冲回放尚未完成；期间不通知消费者
    sync_in_progress: bool,
    init_failed: bool,
    /// 最近一次应用的事件时间戳（增量补齐的起点）
    last_applied_ts: Option<Timestamp>,
    receivers: Option<(
        mpsc::UnboundedReceiver<ConnectionEvent>,
        mpsc::UnboundedReceiver<Command>,
    )>,
}

struct Shared {
    config: SyncConfig,
    connection: ConnectionManager,
    source: Arc<dyn SnapshotSource>,
    entities: RwLock<HashMap<String, Entity>>,
    events: EventManager,
    stats: SharedStats,
    batcher: MessageBatcher<serde_json::Value>,
    batch_sink: Arc<TransportBatchSink>,
    commands: mpsc::UnboundedSender<Command>,
    control: Mutex<Control>,
}

/// 同步协调器
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .field("entities", &self.len())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        let normalizer = Arc::new(DefaultNormalizer::new(config.payload_delimiter));
        Self::with_normalizer(config, transport, source, normalizer)
    }

    pub fn with_normalizer(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = SharedStats::new();
        let batch_sink = Arc::new(TransportBatchSink::new(
            transport.clone(),
            config.batcher.topic_prefix.clone(),
            config.connection.qos,
        ));
        let batcher = MessageBatcher::with_sink(config.batcher.interval(), batch_sink.clone());
        let (connection, connection_rx) = ConnectionManager::new(
            config.connection.clone(),
            transport,
            normalizer,
            stats.clone(),
        );
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let control = Control {
            receivers: Some((connection_rx, commands_rx)),
            ..Default::default()
        };

        Ok(Self {
            shared: Arc::new(Shared {
                events: EventManager::new(config.event_buffer_size),
                config,
                connection,
                source,
                entities: RwLock::new(HashMap::new()),
                stats,
                batcher,
                batch_sink,
                commands,
                control: Mutex::new(control),
            }),
        })
    }

    /// 启动同步（幂等）
    ///
    /// - 未连接（或重连耗尽后处于 `Error`）：建立连接
    /// - 初始快照拉取失败后仍停在 `LoadingInitial`：重新拉取
    /// - 其余状态：无操作
    pub async fn start_sync(&self) -> Result<()> {
        self.ensure_driver();

        match self.shared.connection.state() {
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.shared.connection.connect().await
            }
            ConnectionState::LoadingInitial => {
                let init_failed = self.shared.control.lock().init_failed;
                if init_failed {
                    info!("重新拉取初始快照");
                    self.start_fetch(self.shared.connection.epoch());
                }
                Ok(())
            }
            state => {
                debug!("同步已在进行（{}），忽略 start_sync", state);
                Ok(())
            }
        }
    }

    /// 手动重试初始快照拉取
    pub fn retry_initial_load(&self) -> Result<()> {
        let state = self.shared.connection.state();
        if state != ConnectionState::LoadingInitial {
            return Err(SyncError::InvalidOperation(format!(
                "retry_initial_load() called in state {}",
                state
            )));
        }
        self.ensure_driver();
        self.start_fetch(self.shared.connection.epoch());
        Ok(())
    }

    /// 断开：取消拉取、断开连接、清空映射并通知消费者
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut control = self.shared.control.lock();
            if let Some(fetch) = control.fetch.take() {
                fetch.abort();
            }
            control.fetch_generation += 1;
            control.sync_in_progress = false;
            control.init_failed = false;
            control.last_applied_ts = None;
        }

        // 传输层断开前等待合批发布完成
        let flushed = self.shared.batcher.flush_all();
        if flushed > 0 {
            debug!("断开前发送合批消息 {} 条", flushed);
        }
        self.shared.batch_sink.flushed().await;
        let result = self.shared.connection.disconnect().await;

        self.shared.entities.write().clear();
        self.notify();
        result
    }

    /// 断开并停止驱动任务
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.disconnect().await;
        self.shared.batcher.dispose();
        if let Some(driver) = self.shared.control.lock().driver.take() {
            driver.abort();
        }
        self.shared.events.clear_observers();
        info!("同步协调器已关闭");
        result
    }

    /// 当前视图：按 `updated_at` 降序，相同时按 ID
    pub fn entities(&self) -> Vec<Entity> {
        let entities = self.shared.entities.read();
        let mut view: Vec<Entity> = entities.values().cloned().collect();
        view.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        view
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.shared.entities.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.stats.snapshot()
    }

    pub fn event_stats(&self) -> EventStats {
        self.shared.events.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.shared.events.subscribe_filtered(filter)
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.shared.events.add_observer(observer);
    }

    pub fn transport_gate(&self) -> TransportGate {
        self.shared.connection.transport_gate()
    }

    /// 高频遥测合批器，结果发布到 `<topic_prefix>/<channel>`
    pub fn batcher(&self) -> &MessageBatcher<serde_json::Value> {
        &self.shared.batcher
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.connection
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    fn ensure_driver(&self) {
        let mut control = self.shared.control.lock();
        if control.driver.is_some() {
            return;
        }
        let Some((connection_rx, commands_rx)) = control.receivers.take() else {
            return;
        };

        let weak = Arc::downgrade(&self.shared);
        control.driver = Some(tokio::spawn(drive(weak, connection_rx, commands_rx)));
        debug!("同步驱动任务已启动");
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.shared.connection.epoch()
    }

    fn notify(&self) {
        self.shared
            .events
            .emit(event_builders::entities_updated(self.entities()));
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { old, new, .. } => {
                self.shared
                    .events
                    .emit(event_builders::state_changed(old, new));

                if new == ConnectionState::Ready {
                    let finished_sync = {
                        let mut control = self.shared.control.lock();
                        std::mem::replace(&mut control.sync_in_progress, false)
                    };
                    if finished_sync {
                        self.notify();
                    }
                }
            }
            ConnectionEvent::InitialDataRequired { epoch } => {
                if self.is_current(epoch) {
                    self.start_fetch(epoch);
                }
            }
            ConnectionEvent::Apply { epoch, event } => {
                if !self.is_current(epoch) {
                    debug!("丢弃过期事件: id={}, epoch={}", event.id, epoch);
                    return;
                }
                let timestamp = event.timestamp;
                if self.apply_event(epoch, event) {
                    self.shared.stats.record_processed();
                    let notify = {
                        let mut control = self.shared.control.lock();
                        control.last_applied_ts =
                            Some(control.last_applied_ts.map_or(timestamp, |t| t.max(timestamp)));
                        !control.sync_in_progress
                    };
                    if notify {
                        self.notify();
                    }
                }
            }
            ConnectionEvent::SyncCompleted { report, .. } => {
                self.shared
                    .events
                    .emit(event_builders::sync_completed(report));
            }
            ConnectionEvent::Resynced { epoch } => {
                if !self.is_current(epoch) {
                    return;
                }
                if self.shared.config.delta_resync {
                    self.start_delta(epoch);
                } else {
                    self.shared.events.emit(event_builders::resynced(0));
                }
            }
            ConnectionEvent::MaxReconnectAttemptsReached { attempts } => {
                self.shared
                    .events
                    .emit(event_builders::max_reconnect_attempts(attempts));
            }
            ConnectionEvent::Error(error) => {
                self.shared.events.emit(event_builders::error(error));
            }
        }
    }

    fn handle_command(&self, command: Command) {
        match command {
            Command::SnapshotFetched {
                epoch,
                generation,
                entities,
                snapshot_ts,
            } => {
                if !self.is_current(epoch) || !self.is_current_fetch(generation) {
                    debug!("丢弃过期快照: epoch={}, generation={}", epoch, generation);
                    return;
                }
                self.load_snapshot(epoch, entities, snapshot_ts);
            }
            Command::SnapshotFailed {
                epoch,
                generation,
                attempts,
                error,
            } => {
                if !self.is_current(epoch) || !self.is_current_fetch(generation) {
                    return;
                }
                {
                    let mut control = self.shared.control.lock();
                    control.init_failed = true;
                    control.fetch = None;
                }
                error!("初始快照拉取失败（{} 次）: {}", attempts, error);
                self.shared.events.emit(event_builders::initialization_failed(
                    attempts,
                    error.to_string(),
                ));
            }
            Command::DeltaFetched { epoch, records } => {
                if !self.is_current(epoch) {
                    return;
                }
                let applied = match records {
                    Some(records) => self.apply_delta(epoch, records),
                    None => 0,
                };
                if applied > 0 {
                    self.notify();
                }
                self.shared.events.emit(event_builders::resynced(applied));
            }
        }
    }

    fn is_current_fetch(&self, generation: u64) -> bool {
        self.shared.control.lock().fetch_generation == generation
    }

    fn load_snapshot(&self, epoch: u64, rows: Vec<Entity>, snapshot_ts: Timestamp) {
        let row_count = rows.len();
        let mut map = HashMap::with_capacity(row_count);
        for entity in rows {
            map.insert(entity.id.clone(), entity);
        }
        if map.len() < row_count {
            warn!("快照包含 {} 条重复 ID，以最后一条为准", row_count - map.len());
        }
        let canonical: Vec<Entity> = map.values().cloned().collect();

        {
            let mut entities = self.shared.entities.write();
            if !self.is_current(epoch)
                || self.shared.connection.state() != ConnectionState::LoadingInitial
            {
                // 拉取期间连接已断开，重连后会重新请求快照
                debug!("连接状态已变化，放弃本次快照");
                return;
            }
            *entities = map;
        }
        {
            let mut control = self.shared.control.lock();
            control.sync_in_progress = true;
            control.init_failed = false;
            control.fetch = None;
            control.last_applied_ts = Some(snapshot_ts);
        }
        info!("快照已载入: {} 条", canonical.len());

        if let Err(e) = self.shared.connection.start_sync(&canonical, snapshot_ts) {
            warn!("start_sync 失败: {}", e);
            self.shared.control.lock().sync_in_progress = false;
            self.shared.events.emit(event_builders::error(e));
        }
    }

    /// 稳态事件处理，返回映射是否发生变化
    fn apply_event(&self, epoch: u64, event: Event) -> bool {
        let Event {
            id,
            change,
            timestamp,
            ..
        } = event;
        let mut entities = self.shared.entities.write();
        if !self.is_current(epoch) {
            debug!("丢弃过期事件: id={}, epoch={}", id, epoch);
            return false;
        }

        match change {
            Change::Created(fields) => {
                if entities.contains_key(&id) {
                    debug!("实体已存在，忽略 new 事件: {}", id);
                    self.shared.stats.record_duplicate();
                    return false;
                }
                let entity = Entity::from_fields(id.clone(), &fields, timestamp);
                entities.insert(id, entity);
                true
            }
            Change::Updated(fields) => match entities.get_mut(&id) {
                Some(entity) if timestamp < entity.updated_at => {
                    debug!(
                        "忽略过期更新: id={}, event={}, current={}",
                        id, timestamp, entity.updated_at
                    );
                    self.shared.stats.record_stale();
                    false
                }
                Some(entity) => {
                    entity.merge(&fields, timestamp);
                    true
                }
                None => {
                    let entity = Entity::from_fields(id.clone(), &fields, timestamp);
                    entities.insert(id, entity);
                    true
                }
            },
            Change::Deleted => entities.remove(&id).is_some(),
            Change::StatusChanged { status } => match entities.get_mut(&id) {
                Some(entity) if timestamp < entity.updated_at => {
                    self.shared.stats.record_stale();
                    false
                }
                Some(entity) => {
                    entity.apply_status(&status, timestamp);
                    true
                }
                None => {
                    debug!("状态变更目标不存在: {}", id);
                    false
                }
            },
        }
    }

    /// 合并增量，返回产生变化的记录数
    fn apply_delta(&self, epoch: u64, records: Vec<DeltaRecord>) -> usize {
        let total = records.len();
        let mut applied = 0;
        let mut latest = None;
        {
            let mut entities = self.shared.entities.write();
            if !self.is_current(epoch) {
                debug!("丢弃过期增量: {} 条", total);
                return 0;
            }
            for record in records {
                let timestamp = record.timestamp();
                let changed = match record {
                    DeltaRecord::Insert { entity } | DeltaRecord::Update { entity } => {
                        match entities.get_mut(&entity.id) {
                            Some(existing) if entity.updated_at < existing.updated_at => {
                                self.shared.stats.record_stale();
                                false
                            }
                            Some(existing) => {
                                *existing = entity;
                                true
                            }
                            None => {
                                entities.insert(entity.id.clone(), entity);
                                true
                            }
                        }
                    }
                    DeltaRecord::Delete { id, .. } => entities.remove(&id).is_some(),
                    DeltaRecord::Status { id, status, timestamp } => match entities.get_mut(&id) {
                        Some(entity) if timestamp >= entity.updated_at => {
                            entity.apply_status(&status, timestamp);
                            true
                        }
                        _ => false,
                    },
                };
                if changed {
                    applied += 1;
                    latest = Some(latest.map_or(timestamp, |t: Timestamp| t.max(timestamp)));
                }
            }
        }

        if let Some(latest) = latest {
            let mut control = self.shared.control.lock();
            control.last_applied_ts = Some(control.last_applied_ts.map_or(latest, |t| t.max(latest)));
        }
        info!("增量补齐: {} 条记录, 生效 {} 条", total, applied);
        applied
    }

    fn start_fetch(&self, epoch: u64) {
        let mut control = self.shared.control.lock();
        if let Some(previous) = control.fetch.take() {
            previous.abort();
        }
        control.fetch_generation += 1;
        control.init_failed = false;

        let generation = control.fetch_generation;
        let source = self.shared.source.clone();
        let policy = self.shared.config.fetch.retry_policy();
        let timeout = self.shared.config.fetch.timeout();
        let stats = self.shared.stats.clone();
        let commands = self.shared.commands.clone();

        info!("开始拉取初始快照（最多 {} 次）", policy.max_retries);
        control.fetch = Some(tokio::spawn(async move {
            let command = match fetch_with_retry(source.as_ref(), policy, timeout, &stats).await {
                Ok((entities, snapshot_ts)) => Command::SnapshotFetched {
                    epoch,
                    generation,
                    entities,
                    snapshot_ts,
                },
                Err((attempts, error)) => Command::SnapshotFailed {
                    epoch,
                    generation,
                    attempts,
                    error,
                },
            };
            let _ = commands.send(command);
        }));
    }

    fn start_delta(&self, epoch: u64) {
        let since = {
            let control = self.shared.control.lock();
            control
                .last_applied_ts
                .or(self.shared.stats.snapshot().last_sync_time)
                .unwrap_or(0)
        };
        let source = self.shared.source.clone();
        let timeout = self.shared.config.fetch.timeout();
        let commands = self.shared.commands.clone();
        let events_on_error = Arc::downgrade(&self.shared);

        info!("重连后拉取增量: since={}", since);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, source.fetch_delta(since)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout("delta fetch timed out".into())),
            };
            match result {
                Ok(records) => {
                    let _ = commands.send(Command::DeltaFetched { epoch, records });
                }
                Err(e) => {
                    // 增量失败不影响稳态：重连期间的缓冲已回放
                    warn!("增量拉取失败: {}", e);
                    if let Some(shared) = events_on_error.upgrade() {
                        shared.events.emit(event_builders::error(e));
                    }
                    let _ = commands.send(Command::DeltaFetched {
                        epoch,
                        records: None,
                    });
                }
            }
        });
    }
}

async fn fetch_with_retry(
    source: &dyn SnapshotSource,
    policy: FetchRetryPolicy,
    timeout: Duration,
    stats: &SharedStats,
) -> std::result::Result<(Vec<Entity>, Timestamp), (u32, SyncError)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        stats.record_fetch_attempt();

        let result = match tokio::time::timeout(timeout, source.fetch_snapshot()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "snapshot fetch timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(rows) => return Ok((rows, now_millis())),
            Err(e) if policy.should_retry(attempt) => {
                let pause = policy.pause_for(attempt);
                warn!(
                    "快照拉取失败（第 {}/{} 次）: {}，{}ms 后重试",
                    attempt,
                    policy.max_retries,
                    e,
                    pause.as_millis()
                );
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err((attempt, e)),
        }
    }
}

/// 驱动任务：连接事件优先，其次是拉取结果
async fn drive(
    shared: Weak<Shared>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let input = tokio::select! {
            biased;
            Some(event) = connection_events.recv() => Input::Connection(event),
            Some(command) = commands.recv() => Input::Command(command),
            else => break,
        };

        let Some(shared) = shared.upgrade() else { break };
        let coordinator = SyncCoordinator { shared };
        match input {
            Input::Connection(event) => coordinator.handle_connection_event(event),
            Input::Command(command) => coordinator.handle_command(command),
        }
    }
    debug!("同步驱动任务退出");
}
