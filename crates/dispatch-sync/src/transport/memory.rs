//! 进程内 broker
//!
//! 支持通配符订阅、持久会话（离线期间的消息在重连后补投）以及
//! 可编排的故障：拒绝连接、连接延迟、主动断开客户端。

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{topic_matches, ConnectOptions, Qos, Transport, TransportSignal};
use crate::error::{Result, SyncError};

#[derive(Debug, Default)]
struct Session {
    subscriptions: Vec<(String, Qos)>,
    sink: Option<mpsc::UnboundedSender<TransportSignal>>,
    /// 离线期间积压的消息（仅持久会话）
    pending: VecDeque<(String, Bytes)>,
    persistent: bool,
}

impl Session {
    fn is_online(&self) -> bool {
        self.sink.as_ref().is_some_and(|sink| !sink.is_closed())
    }

    fn qos_for(&self, topic: &str) -> Option<Qos> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    sessions: HashMap<String, Session>,
    refuse_connections: bool,
    fail_next_connects: u32,
    connect_delay: Option<Duration>,
    connect_count: u64,
}

/// 进程内 broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定客户端创建传输
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// 拒绝后续所有连接，直到恢复
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// 接下来的 `n` 次连接失败
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_next_connects = n;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// 累计成功连接次数
    pub fn connect_count(&self) -> u64 {
        self.state.lock().connect_count
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .is_some_and(Session::is_online)
    }

    /// 发布消息，返回立即投递的会话数
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        let mut delivered = 0;

        for (client_id, session) in state.sessions.iter_mut() {
            let Some(qos) = session.qos_for(topic) else {
                continue;
            };

            let signal = TransportSignal::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            let sent = match &session.sink {
                Some(sink) => sink.send(signal).is_ok(),
                None => false,
            };

            if sent {
                delivered += 1;
            } else if session.persistent && qos >= Qos::AtLeastOnce {
                session.sink = None;
                session.pending.push_back((topic.to_string(), payload.clone()));
                debug!("客户端 {} 离线，消息已积压: {}", client_id, topic);
            }
        }

        delivered
    }

    /// 模拟服务端断开某个客户端
    pub fn drop_client(&self, client_id: &str, reason: &str) {
        let sink = self
            .state
            .lock()
            .sessions
            .get_mut(client_id)
            .and_then(|session| session.sink.take());

        if let Some(sink) = sink {
            info!("broker 断开客户端 {}: {}", client_id, reason);
            let _ = sink.send(TransportSignal::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// 向客户端推送任意信号（用于模拟传输层错误或客户端库重连）
    pub fn signal(&self, client_id: &str, signal: TransportSignal) -> bool {
        let state = self.state.lock();
        match state.sessions.get(client_id).and_then(|s| s.sink.as_ref()) {
            Some(sink) => sink.send(signal).is_ok(),
            None => false,
        }
    }

    async fn connect_client(
        &self,
        options: &ConnectOptions,
        sink: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(SyncError::Connection(format!(
                "{} refused connection",
                options.broker_url
            )));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(SyncError::Connection(format!(
                "{} unavailable",
                options.broker_url
            )));
        }
        state.connect_count += 1;

        let session = state.sessions.entry(options.client_id.clone()).or_default();
        if options.clean_session {
            *session = Session::default();
        }
        session.persistent = !options.clean_session;

        let _ = sink.send(TransportSignal::Connected);
        let pending: Vec<_> = session.pending.drain(..).collect();
        if !pending.is_empty() {
            info!("向客户端 {} 补投 {} 条离线消息", options.client_id, pending.len());
        }
        for (topic, payload) in pending {
            let _ = sink.send(TransportSignal::Message { topic, payload });
        }
        session.sink = Some(sink);
        Ok(())
    }

    fn subscribe_client(&self, client_id: &str, topics: &[String], qos: Qos) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(client_id)
            .filter(|session| session.is_online())
            .ok_or_else(|| SyncError::Transport(format!("client {} not connected", client_id)))?;

        for topic in topics {
            match session.subscriptions.iter_mut().find(|(f, _)| f == topic) {
                Some(existing) => existing.1 = qos,
                None => session.subscriptions.push((topic.clone(), qos)),
            }
        }
        Ok(())
    }

    fn disconnect_client(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.sink = None;
            if !session.persistent {
                state.sessions.remove(client_id);
            }
        }
    }
}

/// 基于 [`MemoryBroker`] 的传输实现
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: Arc<Mutex<Option<String>>>,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            client_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn current_client(&self) -> Result<String> {
        self.client_id
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Transport("transport not connected".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()> {
        self.broker.connect_client(options, signals).await?;
        *self.client_id.lock() = Some(options.client_id.clone());
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], qos: Qos) -> Result<()> {
        let client_id = self.current_client()?;
        self.broker.subscribe_client(&client_id, topics, qos)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<()> {
        // 发布方也需要在线
        let _ = self.current_client()?;
        if qos == Qos::AtMostOnce {
            debug!("以 QoS 0 发布: {}", topic);
        }
        let delivered = self.broker.publish(topic, payload);
        if delivered == 0 {
            warn!("发布到 {} 的消息没有在线订阅者", topic);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(client_id) = self.client_id.lock().take() {
            self.broker.disconnect_client(&client_id);
        }
        Ok(())
    }
}
