use crate::connection_state::ConnectionState;

/// 单条消息解析失败
///
/// 只影响这一条消息：记录日志后丢弃，不改变引擎状态。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("missing field `{field}` on {topic}")]
    MissingField { topic: String, field: &'static str },

    #[error("invalid field `{field}` on {topic}: {reason}")]
    InvalidField {
        topic: String,
        field: &'static str,
        reason: String,
    },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

impl ParseError {
    pub fn topic(&self) -> &str {
        match self {
            ParseError::Malformed { topic, .. }
            | ParseError::MissingField { topic, .. }
            | ParseError::InvalidField { topic, .. } => topic,
            ParseError::UnknownTopic(topic) => topic,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Buffer overflow: evicted oldest message on {topic} (capacity {capacity})")]
    BufferOverflow { topic: String, capacity: usize },

    #[error("Max reconnect attempts reached ({0})")]
    MaxReconnectAttempts(u32),

    #[error("Initialization failed after {attempts} attempts: {reason}")]
    InitializationFailed { attempts: u32, reason: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SyncError::Timeout(error.to_string())
        } else {
            SyncError::Fetch(error.to_string())
        }
    }
}

impl SyncError {
    /// 是否属于可自动重试的错误（连接 / 拉取类）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::Transport(_)
                | SyncError::Timeout(_)
                | SyncError::Fetch(_)
        )
    }

    /// 是否为终态错误（引擎不会再自动恢复）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MaxReconnectAttempts(_) | SyncError::InitializationFailed { .. }
        )
    }

    /// 错误分类名，用于日志和事件统计
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Connection(_) => "connection",
            SyncError::Transport(_) => "transport",
            SyncError::Timeout(_) => "timeout",
            SyncError::Fetch(_) => "fetch",
            SyncError::Parse(_) => "parse",
            SyncError::BufferOverflow { .. } => "buffer_overflow",
            SyncError::MaxReconnectAttempts(_) => "max_reconnect_attempts",
            SyncError::InitializationFailed { .. } => "initialization_failed",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::InvalidOperation(_) => "invalid_operation",
            SyncError::Cancelled(_) => "cancelled",
            SyncError::Config(_) => "config",
            SyncError::Serialization(_) => "serialization",
            SyncError::IO(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncError::Timeout("connect".into()).is_retryable());
        assert!(SyncError::Fetch("503".into()).is_retryable());
        assert!(!SyncError::Parse(ParseError::UnknownTopic("x".into())).is_retryable());

        assert!(SyncError::MaxReconnectAttempts(10).is_fatal());
        assert!(!SyncError::Connection("refused".into()).is_fatal());

        let err = SyncError::InvalidTransition {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Ready,
        };
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(err.to_string(), "Invalid state transition: Disconnected -> Ready");
    }

    #[test]
    fn test_parse_error_topic() {
        let err = ParseError::MissingField {
            topic: "dispatch/orders/status".into(),
            field: "status",
        };
        assert_eq!(err.topic(), "dispatch/orders/status");

        let wrapped: SyncError = err.into();
        assert_eq!(wrapped.kind(), "parse");
    }
}
