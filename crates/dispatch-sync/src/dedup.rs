use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::event::{Entity, Event};
use crate::utils::Timestamp;

/// 去重键
///
/// - 负载带消息 ID 时使用 `(topic, message_id)`
/// - 否则使用 `(topic, 实体 ID, 时间戳)`
/// - 快照中的每条实体以 `(实体 ID, updated_at)` 版本键预置：
///   恰好描述快照版本的事件视为"已体现"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Message {
        topic: String,
        message_id: String,
    },
    Entity {
        topic: String,
        id: String,
        timestamp: Timestamp,
    },
    Version {
        id: String,
        timestamp: Timestamp,
    },
}

impl DedupKey {
    pub fn for_event(event: &Event) -> Self {
        match &event.message_id {
            Some(message_id) => DedupKey::Message {
                topic: event.topic.clone(),
                message_id: message_id.clone(),
            },
            None => DedupKey::Entity {
                topic: event.topic.clone(),
                id: event.id.clone(),
                timestamp: event.timestamp,
            },
        }
    }

    pub fn version(id: impl Into<String>, timestamp: Timestamp) -> Self {
        DedupKey::Version {
            id: id.into(),
            timestamp,
        }
    }
}

/// 已应用事件的去重记录
///
/// 容量有界，超出后按 FIFO 淘汰最早的键。
#[derive(Debug)]
pub struct DedupRecord {
    keys: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
    evicted: u64,
}

impl DedupRecord {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: HashSet::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            evicted: 0,
        }
    }

    /// 检查事件是否已应用过（或已被快照体现）
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let key = DedupKey::for_event(event);
        if self.keys.contains(&key) {
            debug!("检测到重复事件: topic={}, id={}", event.topic, event.id);
            return true;
        }

        let version = DedupKey::version(event.id.clone(), event.timestamp);
        if self.keys.contains(&version) {
            debug!(
                "事件已被快照体现: id={}, timestamp={}",
                event.id, event.timestamp
            );
            return true;
        }

        false
    }

    /// 记录已应用的事件
    pub fn record(&mut self, event: &Event) {
        self.insert(DedupKey::for_event(event));
    }

    /// 以快照内容预置版本键
    pub fn seed_snapshot(&mut self, entities: &[Entity]) {
        for entity in entities {
            self.insert(DedupKey::version(entity.id.clone(), entity.updated_at));
        }
        debug!("去重记录已预置快照版本: {} 条", entities.len());
    }

    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
                self.evicted += 1;
            }
        }

        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 累计淘汰数
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
        debug!("去重记录已清空");
    }
}
