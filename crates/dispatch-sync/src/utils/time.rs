//! 时间处理工具
//!
//! 引擎内部所有时间字段统一使用 UTC 毫秒时间戳（`i64`），
//! 生成方式统一为 `Utc::now().timestamp_millis()`。

use chrono::{DateTime, Utc};

/// UTC 毫秒时间戳
pub type Timestamp = i64;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// 解析 JSON 中的时间字段
///
/// 支持：
/// - 整数毫秒时间戳
/// - 浮点数（截断为毫秒）
/// - 纯数字字符串
/// - RFC 3339 字符串（如 `2024-05-01T08:30:00Z`）
pub fn parse_timestamp(value: &serde_json::Value) -> Option<Timestamp> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

/// 解析字符串形式的时间字段
pub fn parse_timestamp_str(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if let Ok(millis) = s.parse::<i64>() {
        return Some(millis);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}
