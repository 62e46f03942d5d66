//! 同步引擎演示
//!
//! 用内存 broker 模拟推送：快照拉取期间到达的事件先缓冲，
//! 完成后只回放同步窗口内的部分；随后演示断线重连与高频合批。

use async_trait::async_trait;
use dispatch_sync::{
    now_millis, Entity, MemoryBroker, SnapshotSource, SyncConfig, SyncCoordinator, SyncEvent,
    SyncObserver,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// 模拟后端：固定延迟后返回两条订单
#[derive(Debug)]
struct DemoSource;

#[async_trait]
impl SnapshotSource for DemoSource {
    async fn fetch_snapshot(&self) -> dispatch_sync::Result<Vec<Entity>> {
        sleep(Duration::from_millis(300)).await;
        let now = now_millis();
        Ok(vec![
            Entity::new("1001", now - 60_000)
                .with_status("pending")
                .with_field("customer", json!("ACME")),
            Entity::new("1002", now - 30_000)
                .with_status("assigned")
                .with_field("driver", json!("d-7")),
        ])
    }
}

struct PrintObserver;

impl SyncObserver for PrintObserver {
    fn on_entities_update(&self, entities: &[Entity]) {
        println!("📋 当前订单 {} 条:", entities.len());
        for entity in entities {
            println!(
                "   #{} {} @ {}",
                entity.id,
                entity.status.as_deref().unwrap_or("-"),
                entity.updated_at
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 调度同步引擎演示\n");

    let config = SyncConfig::builder()
        .broker_url("memory://demo")
        .client_id("ops-console-demo")
        .topics(["dispatch/orders/+"])
        .reconnect(Duration::from_millis(200), Duration::from_secs(2), 5)
        .build()?;

    let broker = MemoryBroker::new();
    let coordinator = SyncCoordinator::new(
        config,
        Arc::new(broker.transport()),
        Arc::new(DemoSource),
    )?;
    coordinator.add_observer(Arc::new(PrintObserver));

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::StateChanged {
                    old_state,
                    new_state,
                    ..
                } => println!("🔄 {} -> {}", old_state, new_state),
                SyncEvent::SyncCompleted { report, .. } => println!(
                    "✅ 初始同步完成: 回放 {} 条, 丢弃 {} 条",
                    report.applied, report.discarded
                ),
                SyncEvent::Error { error, .. } => println!("⚠️  {}", error),
                _ => {}
            }
        }
    });

    println!("🔌 开始同步...");
    coordinator.start_sync().await?;

    // 快照拉取期间到达：早于快照的被丢弃
    broker.publish(
        "dispatch/orders/update",
        json!({"id": "1001", "timestamp": now_millis() - 120_000, "driver": "old"}).to_string(),
    );
    sleep(Duration::from_millis(500)).await;

    println!("\n📡 稳态推送");
    broker.publish(
        "dispatch/orders/new",
        json!({"id": "1003", "timestamp": now_millis(), "customer": "Globex"}).to_string(),
    );
    // 分隔符文本负载：id|timestamp|key=value
    broker.publish(
        "dispatch/orders/status",
        format!("1002|{}|status=delivered", now_millis()),
    );
    sleep(Duration::from_millis(100)).await;

    println!("\n📴 模拟断线");
    broker.drop_client("ops-console-demo", "demo blip");
    broker.publish(
        "dispatch/orders/update",
        json!({"id": "1001", "timestamp": now_millis(), "driver": "d-9"}).to_string(),
    );
    sleep(Duration::from_secs(1)).await;

    println!("\n📦 高频合批");
    for i in 0..5 {
        coordinator
            .batcher()
            .add("gps", json!({"driver": "d-9", "seq": i}));
    }
    sleep(Duration::from_millis(200)).await;
    println!("   {:?}", coordinator.batcher().stats());

    let stats = coordinator.stats();
    println!("\n📊 统计: {}", serde_json::to_string_pretty(&stats)?);

    coordinator.shutdown().await?;
    println!("\n👋 已关闭");
    Ok(())
}
