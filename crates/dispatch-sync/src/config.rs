//! 同步引擎配置

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backoff::{FetchRetryPolicy, ReconnectConfig};
use crate::error::{Result, SyncError};
use crate::transport::{ConnectOptions, Qos};

/// 连接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub broker_url: String,
    /// 每次运行稳定的客户端 ID
    pub client_id: String,
    pub topics: Vec<String>,
    pub qos: Qos,
    /// false：跨重连保留会话
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    /// 连接与订阅各自的超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 非稳态期间的消息缓冲容量
    pub buffer_capacity: usize,
    /// 去重记录容量
    pub dedup_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: format!("dispatch-sync-{}", uuid::Uuid::new_v4()),
            topics: vec!["dispatch/orders/+".to_string()],
            qos: Qos::AtLeastOnce,
            clean_session: false,
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            buffer_capacity: 1_000,
            dedup_capacity: 5_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            broker_url: self.broker_url.clone(),
            client_id: self.client_id.clone(),
            topics: self.topics.clone(),
            qos: self.qos,
            clean_session: self.clean_session,
            keep_alive_secs: self.keep_alive_secs,
        }
    }
}

/// 快照拉取配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_retries: u32,
    /// 首次失败后的暂停（毫秒），之后逐次翻倍
    pub base_pause_ms: u64,
    /// 单次拉取超时（毫秒）
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_pause_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> FetchRetryPolicy {
        FetchRetryPolicy::new(self.max_retries, self.base_pause_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 高频消息合批配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// 固定窗口（毫秒）
    pub interval_ms: u64,
    /// 合批结果发布的 topic 前缀
    pub topic_prefix: String,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            topic_prefix: "dispatch/batch".to_string(),
        }
    }
}

impl BatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub fetch: FetchConfig,
    pub batcher: BatcherConfig,
    /// 事件广播通道容量
    pub event_buffer_size: usize,
    /// 重连后是否通过增量接口补齐
    pub delta_resync: bool,
    /// 分隔符文本负载的分隔符
    pub payload_delimiter: char,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            fetch: FetchConfig::default(),
            batcher: BatcherConfig::default(),
            event_buffer_size: 256,
            delta_resync: true,
            payload_delimiter: '|',
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.topics.is_empty() {
            return Err(SyncError::Config("at least one topic is required".into()));
        }
        if connection.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(SyncError::Config("topics must not be empty".into()));
        }
        if connection.client_id.trim().is_empty() {
            return Err(SyncError::Config("client_id must not be empty".into()));
        }
        if connection.qos < Qos::AtLeastOnce {
            return Err(SyncError::Config(
                "qos must be at least AtLeastOnce (no event may be lost)".into(),
            ));
        }
        if connection.buffer_capacity == 0 || connection.dedup_capacity == 0 {
            return Err(SyncError::Config("buffer and dedup capacity must be > 0".into()));
        }
        if connection.connect_timeout_ms == 0 || self.fetch.timeout_ms == 0 {
            return Err(SyncError::Config("timeouts must be > 0".into()));
        }
        if self.fetch.max_retries == 0 {
            return Err(SyncError::Config("fetch.max_retries must be >= 1".into()));
        }
        if self.batcher.interval_ms == 0 {
            return Err(SyncError::Config("batcher.interval_ms must be > 0".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(SyncError::Config("event_buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.connection.broker_url = url.into();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.connection.client_id = client_id.into();
        self
    }

    /// 设置订阅 topic 列表
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.connection.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.config.connection.qos = qos;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.config.connection.clean_session = clean_session;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.connection.buffer_capacity = capacity;
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.config.connection.dedup_capacity = capacity;
        self
    }

    /// 重连退避：初始间隔、上限、最大次数
    pub fn reconnect(mut self, base: Duration, cap: Duration, max_attempts: u32) -> Self {
        self.config.connection.reconnect = ReconnectConfig {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: cap.as_millis() as u64,
            max_attempts,
        };
        self
    }

    /// 快照拉取：最大次数、首次暂停、单次超时
    pub fn fetch(mut self, max_retries: u32, base_pause: Duration, timeout: Duration) -> Self {
        self.config.fetch = FetchConfig {
            max_retries,
            base_pause_ms: base_pause.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
        };
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.config.batcher.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn delta_resync(mut self, enabled: bool) -> Self {
        self.config.delta_resync = enabled;
        self
    }

    pub fn payload_delimiter(mut self, delimiter: char) -> Self {
        self.config.payload_delimiter = delimiter;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.connection.client_id.starts_with("dispatch-sync-"));
        assert_eq!(config.connection.qos, Qos::AtLeastOnce);
        assert!(!config.connection.clean_session);
        assert_eq!(config.connection.reconnect.max_attempts, 10);
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.batcher.interval_ms, 100);

        // 每次运行生成不同的客户端 ID
        assert_ne!(config.connection.client_id, SyncConfig::default().connection.client_id);
    }

    #[test]
    fn test_builder_validates() {
        let config = SyncConfig::builder()
            .client_id("ops-console")
            .topics(["dispatch/orders/+", "dispatch/drivers/#"])
            .reconnect(Duration::from_millis(10), Duration::from_millis(80), 4)
            .build()
            .unwrap();
        assert_eq!(config.connection.topics.len(), 2);
        assert_eq!(config.connection.reconnect.max_delay_ms, 80);

        let err = SyncConfig::builder().qos(Qos::AtMostOnce).build().unwrap_err();
        assert_eq!(err.kind(), "config");

        let err = SyncConfig::builder()
            .topics(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{"connection": {"client_id": "c-1", "buffer_capacity": 50}, "delta_resync": false}"#,
        )
        .unwrap();

        assert_eq!(config.connection.client_id, "c-1");
        assert_eq!(config.connection.buffer_capacity, 50);
        assert_eq!(config.connection.dedup_capacity, 5_000);
        assert!(!config.delta_resync);
        assert_eq!(config.fetch, FetchConfig::default());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fetch": {{"max_retries": 5, "base_pause_ms": 200}}, "payload_delimiter": ";"}}"#
        )
        .unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.fetch.max_retries, 5);
        assert_eq!(config.fetch.timeout_ms, 10_000);
        assert_eq!(config.payload_delimiter, ';');

        let missing = SyncConfig::from_json_file(file.path().with_extension("missing"));
        assert_eq!(missing.unwrap_err().kind(), "io");
    }
}
