//! 连接状态机
//!
//! 状态转换图是固定的，任何不在图中的转换都会被拒绝：
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──transport 连接成功──▶ LoadingInitial
//! LoadingInitial ──start_sync()──▶ Syncing ──同步完成──▶ Ready
//! Ready ──transport 关闭──▶ Reconnecting ──成功──▶ Ready
//!                                        └─耗尽──▶ Error
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Result, SyncError};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 等待初始快照
    LoadingInitial,
    /// 回放缓冲消息
    Syncing,
    /// 稳态
    Ready,
    /// 重连中
    Reconnecting,
    /// 出错（可能正在退避等待重连）
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::LoadingInitial => "LoadingInitial",
            ConnectionState::Syncing => "Syncing",
            ConnectionState::Ready => "Ready",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Error => "Error",
        }
    }

    /// 是否允许从当前状态转换到 `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, LoadingInitial | Error | Disconnected) => true,
            (LoadingInitial, Syncing | Reconnecting | Error | Disconnected) => true,
            (Syncing, Ready | Error | Disconnected) => true,
            (Ready, Reconnecting | Error | Disconnected) => true,
            (Reconnecting, Ready | LoadingInitial | Error | Disconnected) => true,
            (Error, Reconnecting | Connecting | Disconnected) => true,
            _ => false,
        }
    }

    /// 稳态：消息直接应用
    pub fn is_steady(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// 传输层当前是否被认为在线
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::LoadingInitial | ConnectionState::Syncing | ConnectionState::Ready
        )
    }
}

/// 状态机：持有当前状态，并通过 watch 通道对外广播
#[derive(Debug)]
pub struct StateMachine {
    current: ConnectionState,
    publisher: watch::Sender<ConnectionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            current: ConnectionState::Disconnected,
            publisher,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.subscribe()
    }

    /// 执行状态转换
    ///
    /// 返回 `Ok(Some(old))` 表示发生了转换；相同状态返回 `Ok(None)`。
    pub fn transition(&mut self, next: ConnectionState) -> Result<Option<ConnectionState>> {
        let old = self.current;
        if old == next {
            return Ok(None);
        }
        if !old.can_transition_to(next) {
            return Err(SyncError::InvalidTransition { from: old, to: next });
        }

        self.current = next;
        self.publisher.send_replace(next);
        info!("连接状态: {} -> {}", old, next);
        Ok(Some(old))
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
