//! Dispatch Sync - 实时调度订单同步引擎
//!
//! 让内存中的订单视图与后端权威数据保持一致：
//! - 📥 初始快照：请求/响应拉取，带超时与指数退避重试
//! - 📡 增量事件：发布/订阅持续推送，未就绪期间全部缓冲，不丢、不提前应用
//! - 🧮 同步窗口：只回放快照时间戳之后的事件，按 (时间戳, 序号) 排序，去重后应用
//! - 🔁 断线重连：指数退避、次数上限、重连后缓冲回放与增量补齐
//! - 📦 高频合批：按通道固定窗口合并遥测消息
//! - 🚦 就绪门控：传输就绪与业务就绪两道门同时满足才应用消息
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dispatch_sync::{HttpSnapshotSource, MemoryBroker, SyncConfig, SyncCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .client_id("ops-console")
//!         .topics(["dispatch/orders/+"])
//!         .build()?;
//!
//!     let broker = MemoryBroker::new();
//!     let source = HttpSnapshotSource::new("https://dispatch.example.com/api/orders")?;
//!     let coordinator = SyncCoordinator::new(config, Arc::new(broker.transport()), Arc::new(source))?;
//!
//!     let mut events = coordinator.subscribe();
//!     coordinator.start_sync().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {} 条订单", event.event_type(), coordinator.len());
//!     }
//!
//!     coordinator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod utils;
pub mod event;
pub mod normalizer;
pub mod connection_state;
pub mod dedup;
pub mod buffer;
pub mod gate;
pub mod backoff;
pub mod stats;
pub mod transport;
pub mod source;
pub mod events;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod batcher;

// 重新导出核心类型，方便使用
pub use error::{ParseError, Result, SyncError};
pub use utils::{now_millis, Timestamp};
pub use event::{Change, Entity, Event, EventKind, Fields, Timestamped};
pub use normalizer::{DefaultNormalizer, Normalizer, RawPayload};
pub use connection_state::ConnectionState;
pub use dedup::{DedupKey, DedupRecord};
pub use buffer::{BoundedBuffer, BufferedMessage};
pub use gate::{
    Admission, AllOf, FlagGate, GatedConsumer, GatedConsumerStats, GatedQueue, ReadyGate,
    Stamped, TransportGate,
};
pub use backoff::{FetchRetryPolicy, ReconnectBackoff, ReconnectConfig};
pub use stats::{SharedStats, SyncStats};
pub use transport::{
    topic_matches, ConnectOptions, MemoryBroker, MemoryTransport, Qos, Transport, TransportSignal,
};
pub use source::{DeltaRecord, HttpSnapshotSource, SnapshotSource};
pub use events::{
    event_builders, EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent,
    SyncObserver,
};
pub use config::{BatcherConfig, ConnectionConfig, FetchConfig, SyncConfig, SyncConfigBuilder};
pub use connection::{ConnectionEvent, ConnectionManager, SyncReport};
pub use coordinator::SyncCoordinator;
pub use batcher::{BatchSink, BatcherStats, MessageBatcher, TransportBatchSink};
