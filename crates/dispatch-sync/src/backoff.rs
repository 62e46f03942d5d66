//! 重连退避与拉取重试策略

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// 重连退避配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 初始间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大间隔（毫秒）
    pub max_delay_ms: u64,
    /// 最大重连次数，达到后不再自动重连
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,  // 1s → 2s → 4s → ... → 30s 封顶
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// 重连退避：`min(base * 2^attempts, cap)`
///
/// 每次重连信号（定时器触发或传输层主动重连）都计一次；
/// 连接成功后归零。
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// 第 `attempts` 次之后的等待间隔
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let millis = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// 下一次重连前的等待间隔
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempts)
    }

    /// 记录一次重连尝试，返回累计次数
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        debug!(
            "重连尝试 #{}/{}, 下次间隔: {}ms",
            self.attempts,
            self.config.max_attempts,
            self.current_delay().as_millis()
        );
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }

    /// 连接成功后重置
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            info!("重连间隔已重置（此前尝试 {} 次）", self.attempts);
        }
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

/// 快照拉取重试策略
///
/// 第 `n` 次失败后暂停 `base * 2^(n-1)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRetryPolicy {
    pub max_retries: u32,
    pub base_pause_ms: u64,
}

impl FetchRetryPolicy {
    pub fn new(max_retries: u32, base_pause_ms: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_pause_ms,
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的暂停时间
    pub fn pause_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_pause_ms.saturating_mul(factor))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 所有暂停时间之和（全部失败时的最短总耗时）
    pub fn total_pause(&self) -> Duration {
        (1..self.max_retries).map(|attempt| self.pause_for(attempt)).sum()
    }
}
