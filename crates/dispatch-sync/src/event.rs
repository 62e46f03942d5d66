//! 数据模型
//!
//! - [`Event`]：经过规范化的增量事件，强类型，不会携带"半解析"的字段
//! - [`Entity`]：规范业务记录（如调度订单），只由同步协调器持有

use serde::{Deserialize, Serialize};

use crate::utils::Timestamp;

/// 实体字段集合（扁平 JSON 对象）
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// 由 topic 推导出的事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    New,
    Update,
    Delete,
    StatusChange,
}

impl EventKind {
    /// 按 topic 的最后一段推导事件类别
    ///
    /// `dispatch/orders/new`、`dispatch/orders/update`、`dispatch/orders/delete`、
    /// `dispatch/orders/status` 分别对应四种类别。
    pub fn from_topic(topic: &str) -> Option<Self> {
        let last = topic.rsplit('/').next()?.to_ascii_lowercase();
        match last.as_str() {
            "new" | "created" | "create" => Some(EventKind::New),
            "update" | "updated" => Some(EventKind::Update),
            "delete" | "deleted" | "removed" => Some(EventKind::Delete),
            "status" | "status-change" | "status_change" | "statuschange" => {
                Some(EventKind::StatusChange)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::New => "new",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::StatusChange => "status",
        }
    }
}

/// 事件携带的变更（强类型负载）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Created(Fields),
    Updated(Fields),
    Deleted,
    StatusChanged { status: String },
}

impl Change {
    pub fn kind(&self) -> EventKind {
        match self {
            Change::Created(_) => EventKind::New,
            Change::Updated(_) => EventKind::Update,
            Change::Deleted => EventKind::Delete,
            Change::StatusChanged { .. } => EventKind::StatusChange,
        }
    }
}

/// 规范化后的增量事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 实体 ID
    pub id: String,
    /// 负载自带的消息 ID（去重首选键）
    pub message_id: Option<String>,
    pub topic: String,
    pub change: Change,
    /// 事件的有效时间戳（UTC 毫秒）
    pub timestamp: Timestamp,
    /// 同一时间戳内的次序
    pub sequence_number: u64,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.change.kind()
    }
}

/// 可按时间戳排序的消息
pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;

    /// 时间戳相同时的次序
    fn sequence(&self) -> u64 {
        0
    }
}

impl Timestamped for Event {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn sequence(&self) -> u64 {
        self.sequence_number
    }
}

/// 规范业务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "updatedAt", alias = "updated_at", alias = "timestamp")]
    pub updated_at: Timestamp,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(id: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            status: None,
            updated_at,
            fields: Fields::new(),
        }
    }

    /// 由事件字段构建新实体（"new" 事件，或目标不存在的 "update" 事件）
    pub fn from_fields(id: impl Into<String>, fields: &Fields, timestamp: Timestamp) -> Self {
        let mut entity = Self::new(id, timestamp);
        entity.merge(fields, timestamp);
        entity
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// 合并字段
    ///
    /// `status` 字段写入 [`Entity::status`]；`id` 与时间字段不会覆盖。
    pub fn merge(&mut self, fields: &Fields, timestamp: Timestamp) {
        for (key, value) in fields {
            match key.as_str() {
                "id" | "updatedAt" | "updated_at" | "timestamp" => {}
                "status" => {
                    if let Some(status) = value.as_str() {
                        self.status = Some(status.to_string());
                    }
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
        self.updated_at = self.updated_at.max(timestamp);
    }

    /// 状态变更：只更新状态字段和派生的时间字段（`updatedAt`、`<status>_at`）
    pub fn apply_status(&mut self, status: &str, timestamp: Timestamp) {
        self.status = Some(status.to_string());
        self.fields
            .insert(format!("{}_at", status), serde_json::Value::from(timestamp));
        self.updated_at = self.updated_at.max(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_kind_from_topic() {
        assert_eq!(EventKind::from_topic("dispatch/orders/new"), Some(EventKind::New));
        assert_eq!(EventKind::from_topic("dispatch/orders/UPDATE"), Some(EventKind::Update));
        assert_eq!(EventKind::from_topic("orders/deleted"), Some(EventKind::Delete));
        assert_eq!(
            EventKind::from_topic("dispatch/orders/status-change"),
            Some(EventKind::StatusChange)
        );
        assert_eq!(EventKind::from_topic("dispatch/orders/gps"), None);
    }

    #[test]
    fn test_merge_keeps_other_fields() {
        let mut entity = Entity::new("10", 1_000)
            .with_status("pending")
            .with_field("customer", json!("ACME"))
            .with_field("driver", json!("d-1"));

        entity.merge(&fields(json!({"driver": "d-2", "status": "assigned", "id": "99"})), 2_000);

        assert_eq!(entity.id, "10");
        assert_eq!(entity.status.as_deref(), Some("assigned"));
        assert_eq!(entity.field("driver"), Some(&json!("d-2")));
        assert_eq!(entity.field("customer"), Some(&json!("ACME")));
        assert_eq!(entity.updated_at, 2_000);
    }

    #[test]
    fn test_apply_status_sets_derived_timestamp() {
        let mut entity = Entity::new("7", 1_000).with_field("driver", json!("d-1"));
        entity.apply_status("delivered", 5_000);

        assert_eq!(entity.status.as_deref(), Some("delivered"));
        assert_eq!(entity.field("delivered_at"), Some(&json!(5_000)));
        assert_eq!(entity.field("driver"), Some(&json!("d-1")));
        assert_eq!(entity.updated_at, 5_000);
    }

    #[test]
    fn test_entity_json_shape() {
        let entity: Entity = serde_json::from_value(json!({
            "id": "42",
            "status": "pending",
            "updatedAt": 1234,
            "pickup": "Dock 3"
        }))
        .unwrap();

        assert_eq!(entity.updated_at, 1234);
        assert_eq!(entity.field("pickup"), Some(&json!("Dock 3")));

        let alias: Entity = serde_json::from_value(json!({"id": "1", "timestamp": 9})).unwrap();
        assert_eq!(alias.updated_at, 9);
        assert!(alias.status.is_none());
    }
}
