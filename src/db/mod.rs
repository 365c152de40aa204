//! 状态库：每个分享的最新快照和同步历史

mod models;

use crate::core::history::RunHistoryRecord;
use crate::core::share::ShareId;
use crate::core::snapshot::Snapshot;
use crate::error::StoreError;
use async_trait::async_trait;
use models::{HistoryRow, SnapshotRow};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub use sqlx::SqlitePool;

/// 状态库接口
///
/// 写入快照时以 `snapshot.version` 作为期望的当前版本，版本不一致时返回
/// `StoreError::VersionConflict`，写入成功后版本号加一。
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_snapshot(&self, share_id: &ShareId) -> Result<Option<Snapshot>, StoreError>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot, StoreError>;

    /// 追加历史记录，并只保留该分享最新的 `max_history` 条
    async fn append_history(&self, record: &RunHistoryRecord, max_history: u32) -> Result<(), StoreError>;

    /// 在同一个事务中写入快照和历史记录
    async fn commit_cycle(
        &self,
        snapshot: &Snapshot,
        record: &RunHistoryRecord,
        max_history: u32,
    ) -> Result<Snapshot, StoreError>;

    /// 最近的历史记录，按时间先后排列
    async fn recent_history(&self, share_id: &ShareId, limit: u32) -> Result<Vec<RunHistoryRecord>, StoreError>;

    /// 删除分享的快照和历史，下次同步会重新全量转存
    async fn forget_share(&self, share_id: &ShareId) -> Result<(), StoreError>;
}

/// 基于 SQLite 的状态库
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// 打开（或创建）数据库文件并执行迁移
    pub async fn connect(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        // Windows 路径需要转换反斜杠为正斜杠
        let db_path_str = db_path.to_string_lossy().replace('\\', "/");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
            .await?;

        info!("打开状态库: {}", db_path_str);
        Self::from_pool(pool).await
    }

    /// 内存数据库，只使用一个常驻连接，供测试使用
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_snapshot(&self, share_id: &ShareId) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT share_id, version, created_at, entries FROM snapshots WHERE share_id = ?",
        )
        .bind(share_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Snapshot::try_from).transpose()
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot, StoreError> {
        let mut tx = self.pool.begin().await?;
        let saved = write_snapshot(&mut *tx, snapshot).await?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn append_history(&self, record: &RunHistoryRecord, max_history: u32) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_history(&mut *tx, record, max_history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_cycle(
        &self,
        snapshot: &Snapshot,
        record: &RunHistoryRecord,
        max_history: u32,
    ) -> Result<Snapshot, StoreError> {
        let mut tx = self.pool.begin().await?;
        let saved = write_snapshot(&mut *tx, snapshot).await?;
        write_history(&mut *tx, record, max_history).await?;
        tx.commit().await?;

        debug!(
            "已提交快照: share={}, version={}, entries={}",
            saved.share_id,
            saved.version,
            saved.entries.len()
        );
        Ok(saved)
    }

    async fn recent_history(&self, share_id: &ShareId, limit: u32) -> Result<Vec<RunHistoryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM run_history WHERE share_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(share_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(RunHistoryRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn forget_share(&self, share_id: &ShareId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshots WHERE share_id = ?")
            .bind(share_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM run_history WHERE share_id = ?")
            .bind(share_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("已清除分享状态: {}", share_id);
        Ok(())
    }
}

/// 按版本号写入快照，返回写入后的快照
async fn write_snapshot(conn: &mut SqliteConnection, snapshot: &Snapshot) -> Result<Snapshot, StoreError> {
    let entries = serde_json::to_string(&snapshot.entries)?;
    let next_version = snapshot.version + 1;

    let result = if snapshot.version == 0 {
        sqlx::query(
            r#"INSERT INTO snapshots (share_id, version, created_at, entries)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(share_id) DO NOTHING"#,
        )
        .bind(snapshot.share_id.as_str())
        .bind(next_version as i64)
        .bind(snapshot.created_at.timestamp_millis())
        .bind(&entries)
        .execute(&mut *conn)
        .await?
    } else {
        sqlx::query(
            r#"UPDATE snapshots SET version = ?, created_at = ?, entries = ?
               WHERE share_id = ? AND version = ?"#,
        )
        .bind(next_version as i64)
        .bind(snapshot.created_at.timestamp_millis())
        .bind(&entries)
        .bind(snapshot.share_id.as_str())
        .bind(snapshot.version as i64)
        .execute(&mut *conn)
        .await?
    };

    if result.rows_affected() != 1 {
        return Err(StoreError::VersionConflict {
            share_id: snapshot.share_id.to_string(),
            expected: snapshot.version,
        });
    }

    let mut saved = snapshot.clone();
    saved.version = next_version;
    Ok(saved)
}

/// 插入历史记录并删除超出上限的旧记录
async fn write_history(
    conn: &mut SqliteConnection,
    record: &RunHistoryRecord,
    max_history: u32,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO run_history
           (cycle_id, share_id, timestamp, created, updated, skipped, failed, abandoned,
            duration_ms, outcome, error, failed_paths)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(record.cycle_id.to_string())
    .bind(record.share_id.as_str())
    .bind(record.timestamp.timestamp_millis())
    .bind(i64::from(record.created))
    .bind(i64::from(record.updated))
    .bind(i64::from(record.skipped))
    .bind(i64::from(record.failed))
    .bind(i64::from(record.abandoned))
    .bind(record.duration_ms as i64)
    .bind(record.outcome.as_str())
    .bind(&record.error)
    .bind(serde_json::to_string(&record.failed_paths)?)
    .execute(&mut *conn)
    .await?;

    let trimmed = sqlx::query(
        r#"DELETE FROM run_history
           WHERE share_id = ? AND id NOT IN (
               SELECT id FROM run_history WHERE share_id = ? ORDER BY id DESC LIMIT ?
           )"#,
    )
    .bind(record.share_id.as_str())
    .bind(record.share_id.as_str())
    .bind(i64::from(max_history))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if trimmed > 0 {
        debug!("清理了 {} 条旧的历史记录: {}", trimmed, record.share_id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::RunOutcome;
    use crate::core::snapshot::FileEntry;
    use chrono::Utc;

    fn snapshot(id: &ShareId) -> Snapshot {
        Snapshot::from_listing(
            id.clone(),
            vec![
                FileEntry::directory("docs", "d1"),
                FileEntry::file("docs/a.txt", "r1", 12, "abc"),
            ],
        )
    }

    fn record(id: &ShareId, created: u32) -> RunHistoryRecord {
        let mut record = RunHistoryRecord::failed(
            id.clone(),
            Utc::now(),
            RunOutcome::FetchFailed,
            "offline",
            Duration::from_millis(5),
        );
        record.created = created;
        record.failed_paths = vec![format!("f{}", created)];
        record
    }

    #[tokio::test]
    async fn test_snapshot_versioning() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let id = ShareId::new("k", Some("pw"));
        assert!(store.load_snapshot(&id).await.unwrap().is_none());

        let first = store.save_snapshot(&snapshot(&id)).await.unwrap();
        assert_eq!(first.version, 1);

        let loaded = store.load_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.entries, first.entries);
        assert_eq!(loaded.created_at.timestamp_millis(), first.created_at.timestamp_millis());

        // 过期的版本号不能覆盖
        let stale = snapshot(&id);
        assert!(matches!(
            store.save_snapshot(&stale).await,
            Err(StoreError::VersionConflict { expected: 0, .. })
        ));

        let second = store.save_snapshot(&loaded).await.unwrap();
        assert_eq!(second.version, 2);
        assert!(matches!(
            store.save_snapshot(&loaded).await,
            Err(StoreError::VersionConflict { expected: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_history_is_trimmed_to_max() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let id = ShareId::new("k", None);
        let other = ShareId::new("other", None);

        store.append_history(&record(&other, 99), 3).await.unwrap();
        for n in 0..7 {
            store.append_history(&record(&id, n), 3).await.unwrap();
        }

        let history = store.recent_history(&id, 100).await.unwrap();
        let created: Vec<_> = history.iter().map(|r| r.created).collect();
        assert_eq!(created, vec![4, 5, 6]);
        assert_eq!(history[2].failed_paths, vec!["f6"]);
        assert_eq!(history[2].outcome, RunOutcome::FetchFailed);
        assert_eq!(history[2].error.as_deref(), Some("offline"));

        assert_eq!(store.recent_history(&other, 100).await.unwrap().len(), 1);
        assert_eq!(store.recent_history(&id, 2).await.unwrap()[1].created, 6);
    }

    #[tokio::test]
    async fn test_commit_cycle_is_atomic() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let id = ShareId::new("k", None);
        store.save_snapshot(&snapshot(&id)).await.unwrap();

        // 版本冲突时历史记录也不会写入
        let err = store.commit_cycle(&snapshot(&id), &record(&id, 1), 10).await;
        assert!(matches!(err, Err(StoreError::VersionConflict { .. })));
        assert!(store.recent_history(&id, 10).await.unwrap().is_empty());

        let current = store.load_snapshot(&id).await.unwrap().unwrap();
        let committed = store.commit_cycle(&current, &record(&id, 2), 10).await.unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(store.recent_history(&id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forget_share() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let id = ShareId::new("k", None);
        store.commit_cycle(&snapshot(&id), &record(&id, 1), 10).await.unwrap();

        store.forget_share(&id).await.unwrap();

        assert!(store.load_snapshot(&id).await.unwrap().is_none());
        assert!(store.recent_history(&id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let store = SqliteStateStore::connect(&path).await.unwrap();
        let id = ShareId::new("k", None);
        store.save_snapshot(&snapshot(&id)).await.unwrap();
        store.close().await;

        let reopened = SqliteStateStore::connect(&path).await.unwrap();
        assert_eq!(reopened.load_snapshot(&id).await.unwrap().unwrap().version, 1);
    }
}
