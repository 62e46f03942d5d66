use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::utils::Timestamp;

/// 同步统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// 非稳态期间进入缓冲的消息数
    pub messages_queued: u64,
    /// 应用到规范映射的消息数
    pub messages_processed: u64,
    pub duplicates_filtered: u64,
    /// 落在同步窗口之外被丢弃的缓冲消息数
    pub messages_discarded: u64,
    pub buffer_overflows: u64,
    pub parse_errors: u64,
    pub connection_attempts: u64,
    pub reconnect_attempts: u64,
    /// 比现有实体更旧、被忽略的更新
    pub stale_ignored: u64,
    pub snapshot_fetch_attempts: u64,
    pub last_sync_time: Option<Timestamp>,
    pub sync_duration_ms: Option<u64>,
}

/// 连接管理器和同步协调器共享的统计
#[derive(Debug, Clone, Default)]
pub struct SharedStats {
    inner: Arc<RwLock<SyncStats>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncStats {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.inner.write());
    }

    pub fn record_queued(&self) {
        self.inner.write().messages_queued += 1;
    }

    pub fn record_processed(&self) {
        self.inner.write().messages_processed += 1;
    }

    pub fn record_duplicate(&self) {
        self.inner.write().duplicates_filtered += 1;
    }

    pub fn record_duplicates(&self, count: u64) {
        self.inner.write().duplicates_filtered += count;
    }

    pub fn record_discarded(&self, count: u64) {
        self.inner.write().messages_discarded += count;
    }

    pub fn record_overflow(&self) {
        self.inner.write().buffer_overflows += 1;
    }

    pub fn record_parse_error(&self) {
        self.inner.write().parse_errors += 1;
    }

    pub fn record_connection_attempt(&self) {
        self.inner.write().connection_attempts += 1;
    }

    pub fn record_reconnect_attempt(&self) {
        self.inner.write().reconnect_attempts += 1;
    }

    pub fn record_stale(&self) {
        self.inner.write().stale_ignored += 1;
    }

    pub fn record_fetch_attempt(&self) {
        self.inner.write().snapshot_fetch_attempts += 1;
    }

    pub fn record_sync(&self, finished_at: Timestamp, duration_ms: u64) {
        let mut stats = self.inner.write();
        stats.last_sync_time = Some(finished_at);
        stats.sync_duration_ms = Some(duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_counters() {
        let stats = SharedStats::new();
        let other = stats.clone();

        stats.record_queued();
        other.record_duplicate();
        other.record_discarded(3);
        other.record_duplicates(2);
        stats.record_sync(1_000, 25);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_queued, 1);
        assert_eq!(snapshot.duplicates_filtered, 3);
        assert_eq!(snapshot.messages_discarded, 3);
        assert_eq!(snapshot.last_sync_time, Some(1_000));
        assert_eq!(snapshot.sync_duration_ms, Some(25));
    }
}
