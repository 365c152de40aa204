//! 状态库中的行结构

use crate::core::history::{RunHistoryRecord, RunOutcome};
use crate::core::share::ShareId;
use crate::core::snapshot::{FileEntry, Snapshot};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SnapshotRow {
    pub share_id: String,
    pub version: i64,
    /// 毫秒时间戳
    pub created_at: i64,
    /// JSON 数组
    pub entries: String,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let entries: Vec<FileEntry> = serde_json::from_str(&row.entries)?;
        Ok(Snapshot {
            share_id: ShareId::from(row.share_id),
            version: u64::try_from(row.version)
                .map_err(|_| StoreError::Corrupt(format!("快照版本号为负数: {}", row.version)))?,
            created_at: from_millis(row.created_at)?,
            entries,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
#[allow(dead_code)]
pub(crate) struct HistoryRow {
    pub id: i64,
    pub cycle_id: String,
    pub share_id: String,
    pub timestamp: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    pub abandoned: i64,
    pub duration_ms: i64,
    pub outcome: String,
    pub error: Option<String>,
    pub failed_paths: String,
}

impl TryFrom<HistoryRow> for RunHistoryRecord {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(RunHistoryRecord {
            cycle_id: Uuid::parse_str(&row.cycle_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            share_id: ShareId::from(row.share_id),
            timestamp: from_millis(row.timestamp)?,
            created: row.created as u32,
            updated: row.updated as u32,
            skipped: row.skipped as u32,
            failed: row.failed as u32,
            abandoned: row.abandoned as u32,
            duration_ms: row.duration_ms as u64,
            outcome: row.outcome.parse::<RunOutcome>().map_err(StoreError::Corrupt)?,
            error: row.error,
            failed_paths: serde_json::from_str(&row.failed_paths)?,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt(format!("无效的时间戳: {}", millis)))
}
