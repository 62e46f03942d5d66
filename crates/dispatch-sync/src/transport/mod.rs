//! 发布/订阅传输层
//!
//! 引擎只依赖 [`Transport`] trait；具体的 broker 客户端由外部提供。
//! [`memory`] 提供进程内实现，用于演示和测试。

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{MemoryBroker, MemoryTransport};

/// 投递确认级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl Default for Qos {
    fn default() -> Self {
        Qos::AtLeastOnce
    }
}

/// 连接参数
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub broker_url: String,
    /// 每次运行稳定的客户端 ID，重连时保持不变以复用会话
    pub client_id: String,
    pub topics: Vec<String>,
    pub qos: Qos,
    /// false 表示跨重连保留会话（离线期间的消息会被补投）
    pub clean_session: bool,
    pub keep_alive_secs: u64,
}

/// 传输层信号
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Message { topic: String, payload: Bytes },
    Connected,
    /// 客户端库自身发起了重连
    Reconnect,
    Closed { reason: String },
    Error(String),
}

/// 发布/订阅传输
///
/// 信号通过 `connect` 时传入的无界通道投递；每次连接使用新的通道，
/// 旧连接的迟到信号自然失效。同一 topic 的消息保持顺序。
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        options: &ConnectOptions,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()>;

    async fn subscribe(&self, topics: &[String], qos: Qos) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// MQTT 风格的 topic 过滤器匹配（`+` 单层、`#` 多层）
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
