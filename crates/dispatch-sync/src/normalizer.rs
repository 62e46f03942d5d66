//! 传输边界上的负载规范化
//!
//! 原始负载要么是结构化 JSON，要么是分隔符文本，统一转换为强类型的 [`Event`]，
//! 失败则得到独立的 [`ParseError`]。半解析的对象不会进入规范映射。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ParseError;
use crate::event::{Change, Event, EventKind, Fields};
use crate::utils::time::{parse_timestamp, parse_timestamp_str};
use crate::utils::Timestamp;

/// 原始负载
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// JSON 对象
    Structured(serde_json::Value),
    /// 分隔符文本：`id|timestamp|key=value|key=value`
    Delimited(String),
}

impl RawPayload {
    /// 根据内容判断负载格式
    pub fn classify(topic: &str, bytes: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Malformed {
            topic: topic.to_string(),
            reason: format!("invalid utf-8: {}", e),
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Malformed {
                topic: topic.to_string(),
                reason: "empty payload".to_string(),
            });
        }

        if trimmed.starts_with('{') {
            let value = serde_json::from_str(trimmed).map_err(|e| ParseError::Malformed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
            Ok(RawPayload::Structured(value))
        } else {
            Ok(RawPayload::Delimited(trimmed.to_string()))
        }
    }
}

/// 负载规范化器
pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Event, ParseError>;
}

const ID_KEYS: &[&str] = &["id", "orderId", "order_id"];
const MESSAGE_ID_KEYS: &[&str] = &["messageId", "message_id", "msgId", "eventId", "event_id"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "updatedAt", "updated_at", "ts"];
const SEQUENCE_KEYS: &[&str] = &["sequenceNumber", "sequence_number", "seq"];

/// 默认规范化器：JSON 与分隔符文本
#[derive(Debug)]
pub struct DefaultNormalizer {
    delimiter: char,
    /// 负载未携带序号时按到达顺序分配
    next_sequence: AtomicU64,
}

impl DefaultNormalizer {
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            next_sequence: AtomicU64::new(0),
        }
    }

    fn assign_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn normalize_structured(
        &self,
        topic: &str,
        kind: EventKind,
        value: serde_json::Value,
        received_at: Timestamp,
    ) -> Result<Event, ParseError> {
        let serde_json::Value::Object(mut object) = value else {
            return Err(ParseError::Malformed {
                topic: topic.to_string(),
                reason: "payload is not an object".to_string(),
            });
        };

        let id = take_first(&mut object, ID_KEYS)
            .and_then(|v| scalar_to_string(&v))
            .ok_or_else(|| ParseError::MissingField {
                topic: topic.to_string(),
                field: "id",
            })?;

        let message_id = take_first(&mut object, MESSAGE_ID_KEYS).and_then(|v| scalar_to_string(&v));

        let timestamp = match take_first(&mut object, TIMESTAMP_KEYS) {
            Some(v) => parse_timestamp(&v).ok_or_else(|| ParseError::InvalidField {
                topic: topic.to_string(),
                field: "timestamp",
                reason: v.to_string(),
            })?,
            None => received_at,
        };

        let sequence_number = match take_first(&mut object, SEQUENCE_KEYS) {
            Some(v) => v.as_u64().ok_or_else(|| ParseError::InvalidField {
                topic: topic.to_string(),
                field: "sequenceNumber",
                reason: v.to_string(),
            })?,
            None => self.assign_sequence(),
        };

        let change = build_change(topic, kind, object)?;

        Ok(Event {
            id,
            message_id,
            topic: topic.to_string(),
            change,
            timestamp,
            sequence_number,
        })
    }

    fn normalize_delimited(
        &self,
        topic: &str,
        kind: EventKind,
        text: &str,
        received_at: Timestamp,
    ) -> Result<Event, ParseError> {
        let mut parts = text.split(self.delimiter).map(str::trim);

        let id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ParseError::MissingField {
                topic: topic.to_string(),
                field: "id",
            })?
            .to_string();

        let timestamp = match parts.next().filter(|s| !s.is_empty()) {
            Some(raw) => parse_timestamp_str(raw).ok_or_else(|| ParseError::InvalidField {
                topic: topic.to_string(),
                field: "timestamp",
                reason: raw.to_string(),
            })?,
            None => received_at,
        };

        let mut fields = Fields::new();
        for part in parts.filter(|s| !s.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| ParseError::Malformed {
                topic: topic.to_string(),
                reason: format!("expected key=value, got `{}`", part),
            })?;
            fields.insert(key.trim().to_string(), delimited_value(value.trim()));
        }

        let message_id = take_first(&mut fields, MESSAGE_ID_KEYS).and_then(|v| scalar_to_string(&v));
        let sequence_number = take_first(&mut fields, SEQUENCE_KEYS)
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| self.assign_sequence());

        let change = build_change(topic, kind, fields)?;

        Ok(Event {
            id,
            message_id,
            topic: topic.to_string(),
            change,
            timestamp,
            sequence_number,
        })
    }
}

impl Default for DefaultNormalizer {
    fn default() -> Self {
        Self::new('|')
    }
}

impl Normalizer for DefaultNormalizer {
    fn normalize(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Event, ParseError> {
        let kind =
            EventKind::from_topic(topic).ok_or_else(|| ParseError::UnknownTopic(topic.to_string()))?;

        match RawPayload::classify(topic, payload)? {
            RawPayload::Structured(value) => {
                self.normalize_structured(topic, kind, value, received_at)
            }
            RawPayload::Delimited(text) => self.normalize_delimited(topic, kind, &text, received_at),
        }
    }
}

fn build_change(topic: &str, kind: EventKind, mut fields: Fields) -> Result<Change, ParseError> {
    match kind {
        EventKind::New => Ok(Change::Created(fields)),
        EventKind::Update => Ok(Change::Updated(fields)),
        EventKind::Delete => Ok(Change::Deleted),
        EventKind::StatusChange => {
            let status = fields
                .remove("status")
                .ok_or_else(|| ParseError::MissingField {
                    topic: topic.to_string(),
                    field: "status",
                })?;
            match status {
                serde_json::Value::String(status) if !status.is_empty() => {
                    Ok(Change::StatusChanged { status })
                }
                other => Err(ParseError::InvalidField {
                    topic: topic.to_string(),
                    field: "status",
                    reason: other.to_string(),
                }),
            }
        }
    }
}

fn take_first(fields: &mut Fields, keys: &[&str]) -> Option<serde_json::Value> {
    keys.iter().find_map(|key| fields.remove(*key))
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 分隔符文本中的值：能解析为数字 / 布尔就按类型存
fn delimited_value(raw: &str) -> serde_json::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_json::Value::from(f);
    }
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: Timestamp = 1_700_000_000_000;

    #[test]
    fn test_structured_update() {
        let normalizer = DefaultNormalizer::default();
        let payload = json!({
            "id": 10,
            "messageId": "m-1",
            "timestamp": 1_700_000_000_500i64,
            "seq": 7,
            "driver": "d-9"
        })
        .to_string();

        let event = normalizer
            .normalize("dispatch/orders/update", payload.as_bytes(), NOW)
            .unwrap();

        assert_eq!(event.id, "10");
        assert_eq!(event.message_id.as_deref(), Some("m-1"));
        assert_eq!(event.timestamp, 1_700_000_000_500);
        assert_eq!(event.sequence_number, 7);
        match event.change {
            Change::Updated(fields) => {
                assert_eq!(fields.get("driver"), Some(&json!("d-9")));
                assert!(!fields.contains_key("id"));
                assert!(!fields.contains_key("timestamp"));
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_missing_timestamp_uses_receipt_time() {
        let normalizer = DefaultNormalizer::default();
        let event = normalizer
            .normalize("dispatch/orders/delete", br#"{"id":"5"}"#, NOW)
            .unwrap();

        assert_eq!(event.timestamp, NOW);
        assert_eq!(event.change, Change::Deleted);
    }

    #[test]
    fn test_sequence_assigned_in_arrival_order() {
        let normalizer = DefaultNormalizer::default();
        let a = normalizer
            .normalize("dispatch/orders/new", br#"{"id":"1"}"#, NOW)
            .unwrap();
        let b = normalizer
            .normalize("dispatch/orders/new", br#"{"id":"2"}"#, NOW)
            .unwrap();
        assert!(b.sequence_number > a.sequence_number);
    }

    #[test]
    fn test_delimited_status_change() {
        let normalizer = DefaultNormalizer::default();
        let event = normalizer
            .normalize(
                "dispatch/orders/status",
                b"42|1700000000123|status=delivered|eta=15",
                NOW,
            )
            .unwrap();

        assert_eq!(event.id, "42");
        assert_eq!(event.timestamp, 1_700_000_000_123);
        assert_eq!(
            event.change,
            Change::StatusChanged {
                status: "delivered".to_string()
            }
        );
    }

    #[test]
    fn test_delimited_fields_are_typed() {
        let normalizer = DefaultNormalizer::new(',');
        let event = normalizer
            .normalize("dispatch/orders/update", b"7,,eta=15,priority=true,zone=N", NOW)
            .unwrap();

        assert_eq!(event.timestamp, NOW);
        let Change::Updated(fields) = event.change else {
            panic!("expected update");
        };
        assert_eq!(fields.get("eta"), Some(&json!(15)));
        assert_eq!(fields.get("priority"), Some(&json!(true)));
        assert_eq!(fields.get("zone"), Some(&json!("N")));
    }

    #[test]
    fn test_parse_errors() {
        let normalizer = DefaultNormalizer::default();

        let err = normalizer
            .normalize("dispatch/orders/gps", br#"{"id":"1"}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::UnknownTopic(_)));

        let err = normalizer
            .normalize("dispatch/orders/update", br#"{"driver":"d"}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "id", .. }));

        let err = normalizer
            .normalize("dispatch/orders/status", br#"{"id":"1"}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "status", .. }));

        let err = normalizer
            .normalize("dispatch/orders/update", br#"{"id":"1", "#, NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));

        let err = normalizer
            .normalize("dispatch/orders/update", br#"{"id":"1","timestamp":"soon"}"#, NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "timestamp", .. }));

        let err = normalizer
            .normalize("dispatch/orders/update", b"1|2|broken", NOW)
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
    }
}
