//! 事件系统 - 向消费者广播同步引擎的状态
//!
//! 两种订阅方式：
//! - `broadcast` 通道上的 [`SyncEvent`] 流（可按类型过滤）
//! - 回调式的 [`SyncObserver`]

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection::SyncReport;
use crate::connection_state::ConnectionState;
use crate::error::SyncError;
use crate::event::Entity;
use crate::utils::{now_millis, Timestamp};

/// 同步引擎事件
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        timestamp: Timestamp,
    },
    /// 规范映射的完整当前视图（按 `updated_at` 降序）
    EntitiesUpdated {
        entities: Arc<Vec<Entity>>,
        timestamp: Timestamp,
    },
    SyncCompleted {
        report: SyncReport,
        timestamp: Timestamp,
    },
    /// 重连后完成补齐
    Resynced {
        delta_applied: usize,
        timestamp: Timestamp,
    },
    Error {
        error: SyncError,
        timestamp: Timestamp,
    },
    MaxReconnectAttemptsReached {
        attempts: u32,
        timestamp: Timestamp,
    },
    InitializationFailed {
        attempts: u32,
        reason: String,
        timestamp: Timestamp,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StateChanged { .. } => "state_changed",
            SyncEvent::EntitiesUpdated { .. } => "entities_updated",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::Resynced { .. } => "resynced",
            SyncEvent::Error { .. } => "error",
            SyncEvent::MaxReconnectAttemptsReached { .. } => "max_reconnect_attempts_reached",
            SyncEvent::InitializationFailed { .. } => "initialization_failed",
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            SyncEvent::StateChanged { timestamp, .. }
            | SyncEvent::EntitiesUpdated { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::Resynced { timestamp, .. }
            | SyncEvent::Error { timestamp, .. }
            | SyncEvent::MaxReconnectAttemptsReached { timestamp, .. }
            | SyncEvent::InitializationFailed { timestamp, .. } => *timestamp,
        }
    }

    /// 对应的错误（若有）；终态事件也会以错误形式交给观察者
    pub fn as_error(&self) -> Option<SyncError> {
        match self {
            SyncEvent::Error { error, .. } => Some(error.clone()),
            SyncEvent::MaxReconnectAttemptsReached { attempts, .. } => {
                Some(SyncError::MaxReconnectAttempts(*attempts))
            }
            SyncEvent::InitializationFailed {
                attempts, reason, ..
            } => Some(SyncError::InitializationFailed {
                attempts: *attempts,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// 事件构造辅助函数
pub mod event_builders {
    use super::*;

    pub fn state_changed(old_state: ConnectionState, new_state: ConnectionState) -> SyncEvent {
        SyncEvent::StateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn entities_updated(entities: Vec<Entity>) -> SyncEvent {
        SyncEvent::EntitiesUpdated {
            entities: Arc::new(entities),
            timestamp: now_millis(),
        }
    }

    pub fn sync_completed(report: SyncReport) -> SyncEvent {
        SyncEvent::SyncCompleted {
            report,
            timestamp: now_millis(),
        }
    }

    pub fn resynced(delta_applied: usize) -> SyncEvent {
        SyncEvent::Resynced {
            delta_applied,
            timestamp: now_millis(),
        }
    }

    pub fn error(error: SyncError) -> SyncEvent {
        SyncEvent::Error {
            error,
            timestamp: now_millis(),
        }
    }

    pub fn max_reconnect_attempts(attempts: u32) -> SyncEvent {
        SyncEvent::MaxReconnectAttemptsReached {
            attempts,
            timestamp: now_millis(),
        }
    }

    pub fn initialization_failed(attempts: u32, reason: impl Into<String>) -> SyncEvent {
        SyncEvent::InitializationFailed {
            attempts,
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }
}

/// 回调式消费者接口
///
/// 回调在同步协调器的驱动任务中同步执行，实现方不应阻塞。
pub trait SyncObserver: Send + Sync {
    fn on_entities_update(&self, _entities: &[Entity]) {}

    fn on_state_change(&self, _state: ConnectionState) {}

    fn on_error(&self, _error: &SyncError) {}
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        match &self.event_types {
            Some(types) => types.iter().any(|t| t == event.event_type()),
            None => true,
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    /// 没有任何订阅者时发出的事件数
    pub undelivered_events: u64,
    pub observer_count: usize,
    pub last_event_time: Option<Timestamp>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: RwLock::new(Vec::new()),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件：先广播，再依次回调观察者
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        let delivered = self.sender.send(event.clone()).is_ok();
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
            if !delivered {
                stats.undelivered_events += 1;
            }
        }

        // 回调期间不持有锁，允许观察者回调里再注册观察者
        let observers = self.observers.read().clone();
        for observer in &observers {
            match &event {
                SyncEvent::StateChanged { new_state, .. } => observer.on_state_change(*new_state),
                SyncEvent::EntitiesUpdated { entities, .. } => {
                    observer.on_entities_update(entities)
                }
                other => {
                    if let Some(error) = other.as_error() {
                        observer.on_error(&error);
                    }
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        let mut observers = self.observers.write();
        observers.push(observer);
        self.stats.write().observer_count = observers.len();
        info!("已注册观察者，当前 {} 个", observers.len());
    }

    pub fn clear_observers(&self) {
        self.observers.write().clear();
        self.stats.write().observer_count = 0;
    }

    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ConnectionState>>,
        sizes: Mutex<Vec<usize>>,
        errors: Mutex<Vec<&'static str>>,
    }

    impl SyncObserver for Recorder {
        fn on_entities_update(&self, entities: &[Entity]) {
            self.sizes.lock().push(entities.len());
        }

        fn on_state_change(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }

        fn on_error(&self, error: &SyncError) {
            self.errors.lock().push(error.kind());
        }
    }

    #[test]
    fn test_observer_dispatch() {
        let manager = EventManager::new(16);
        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());

        manager.emit(event_builders::state_changed(
            ConnectionState::Syncing,
            ConnectionState::Ready,
        ));
        manager.emit(event_builders::entities_updated(vec![Entity::new("1", 1)]));
        manager.emit(event_builders::max_reconnect_attempts(10));
        manager.emit(event_builders::initialization_failed(3, "boom"));

        assert_eq!(*recorder.states.lock(), vec![ConnectionState::Ready]);
        assert_eq!(*recorder.sizes.lock(), vec![1]);
        assert_eq!(
            *recorder.errors.lock(),
            vec!["max_reconnect_attempts", "initialization_failed"]
        );

        let stats = manager.stats();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.undelivered_events, 4);
        assert_eq!(stats.observer_count, 1);
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let manager = EventManager::new(16);
        let mut errors = manager.subscribe_filtered(
            EventFilter::new().with_event_types(vec!["error".to_string()]),
        );

        manager.emit(event_builders::entities_updated(Vec::new()));
        manager.emit(event_builders::error(SyncError::Fetch("503".into())));

        let event = errors.recv().await.unwrap();
        assert_eq!(event.event_type(), "error");
        assert!(errors.try_recv().is_err());
    }
}
