//! 快照 / 增量数据源（请求-响应）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::event::Entity;
use crate::utils::Timestamp;

/// 增量记录（重连后的补齐）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DeltaRecord {
    Insert { entity: Entity },
    Update { entity: Entity },
    Delete { id: String, timestamp: Timestamp },
    Status { id: String, status: String, timestamp: Timestamp },
}

impl DeltaRecord {
    pub fn id(&self) -> &str {
        match self {
            DeltaRecord::Insert { entity } | DeltaRecord::Update { entity } => &entity.id,
            DeltaRecord::Delete { id, .. } | DeltaRecord::Status { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            DeltaRecord::Insert { entity } | DeltaRecord::Update { entity } => entity.updated_at,
            DeltaRecord::Delete { timestamp, .. } | DeltaRecord::Status { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// 快照数据源
#[async_trait]
pub trait SnapshotSource: Send + Sync + std::fmt::Debug {
    /// 拉取完整快照；完成时刻即为权威的快照时间戳
    async fn fetch_snapshot(&self) -> Result<Vec<Entity>>;

    /// 拉取 `since` 之后的增量；`None` 表示不支持增量
    async fn fetch_delta(&self, _since: Timestamp) -> Result<Option<Vec<DeltaRecord>>> {
        Ok(None)
    }
}

/// 快照响应体：裸数组或 `{"data": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotBody {
    Rows(Vec<Entity>),
    Wrapped { data: Vec<Entity> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeltaBody {
    Rows(Vec<DeltaRecord>),
    Wrapped { data: Vec<DeltaRecord> },
}

/// HTTP 数据源
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    snapshot_url: String,
    delta_url: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(snapshot_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            snapshot_url: snapshot_url.into(),
            delta_url: None,
        })
    }

    pub fn with_delta_url(mut self, delta_url: impl Into<String>) -> Self {
        self.delta_url = Some(delta_url.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Vec<Entity>> {
        debug!("GET {}", self.snapshot_url);
        let body: SnapshotBody = self
            .client
            .get(&self.snapshot_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(match body {
            SnapshotBody::Rows(rows) | SnapshotBody::Wrapped { data: rows } => rows,
        })
    }

    async fn fetch_delta(&self, since: Timestamp) -> Result<Option<Vec<DeltaRecord>>> {
        let Some(url) = &self.delta_url else {
            return Ok(None);
        };

        debug!("GET {}?since={}", url, since);
        let body: DeltaBody = self
            .client
            .get(url)
            .query(&[("since", since)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Some(match body {
            DeltaBody::Rows(rows) | DeltaBody::Wrapped { data: rows } => rows,
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delta_record_wire_format() {
        let records: Vec<DeltaRecord> = serde_json::from_value(json!([
            {"op": "insert", "entity": {"id": "1", "updatedAt": 10, "status": "pending"}},
            {"op": "delete", "id": "2", "timestamp": 11},
            {"op": "status", "id": "3", "status": "delivered", "timestamp": 12}
        ]))
        .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id(), "1");
        assert_eq!(records[1], DeltaRecord::Delete { id: "2".into(), timestamp: 11 });
        assert_eq!(records[2].timestamp(), 12);
    }

    #[test]
    fn test_snapshot_body_shapes() {
        let rows: SnapshotBody = serde_json::from_value(json!([{"id": "1", "updatedAt": 1}])).unwrap();
        let wrapped: SnapshotBody =
            serde_json::from_value(json!({"data": [{"id": "1", "updatedAt": 1}]})).unwrap();

        for body in [rows, wrapped] {
            match body {
                SnapshotBody::Rows(rows) | SnapshotBody::Wrapped { data: rows } => {
                    assert_eq!(rows[0].id, "1")
                }
            }
        }
    }

    #[tokio::test]
    async fn test_http_source_without_delta_url() {
        let source = HttpSnapshotSource::new("http://127.0.0.1:1/orders").unwrap();
        assert!(source.fetch_delta(0).await.unwrap().is_none());
    }
}
