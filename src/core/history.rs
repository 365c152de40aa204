//! 同步历史记录

use crate::core::diff::ActionKind;
use crate::core::executor::{SyncResult, SyncStatus};
use crate::core::share::ShareId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// 一轮同步的总体结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// 至少一个文件失败
    PartiallySucceeded,
    /// 获取分享列表失败，本轮未执行任何动作
    FetchFailed,
    /// 读取或提交状态库失败，上一次快照保持不变
    StoreFailed,
    /// 被取消，部分文件未执行
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartiallySucceeded => "partially_succeeded",
            RunOutcome::FetchFailed => "fetch_failed",
            RunOutcome::StoreFailed => "store_failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "partially_succeeded" => Ok(RunOutcome::PartiallySucceeded),
            "fetch_failed" => Ok(RunOutcome::FetchFailed),
            "store_failed" => Ok(RunOutcome::StoreFailed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            other => Err(format!("未知的同步结果: {}", other)),
        }
    }
}

/// 每个分享每轮同步一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistoryRecord {
    pub cycle_id: Uuid,
    pub share_id: ShareId,
    pub timestamp: DateTime<Utc>,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
    pub abandoned: u32,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    /// 分享级别的错误信息
    pub error: Option<String>,
    /// 失败文件的路径
    pub failed_paths: Vec<String>,
}

impl RunHistoryRecord {
    /// 根据执行结果汇总
    pub fn from_results(
        share_id: ShareId,
        timestamp: DateTime<Utc>,
        results: &[SyncResult],
        duration: Duration,
    ) -> Self {
        let mut record = Self::empty(share_id, timestamp, RunOutcome::Succeeded, duration);

        for result in results {
            match (result.status, result.kind) {
                (SyncStatus::Succeeded, ActionKind::Update) => record.updated += 1,
                (SyncStatus::Succeeded, _) => record.created += 1,
                (SyncStatus::Skipped, _) => record.skipped += 1,
                (SyncStatus::FailedPermanently, _) => {
                    record.failed += 1;
                    record.failed_paths.push(result.path_key());
                }
                (SyncStatus::Abandoned, _) => record.abandoned += 1,
            }
        }

        record.outcome = if record.abandoned > 0 {
            RunOutcome::Cancelled
        } else if record.failed > 0 {
            RunOutcome::PartiallySucceeded
        } else {
            RunOutcome::Succeeded
        };

        record
    }

    /// 分享级别失败，没有执行任何动作
    pub fn failed(
        share_id: ShareId,
        timestamp: DateTime<Utc>,
        outcome: RunOutcome,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut record = Self::empty(share_id, timestamp, outcome, duration);
        record.error = Some(error.into());
        record
    }

    fn empty(share_id: ShareId, timestamp: DateTime<Utc>, outcome: RunOutcome, duration: Duration) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            share_id,
            timestamp,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            abandoned: 0,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            outcome,
            error: None,
            failed_paths: Vec::new(),
        }
    }
}

impl fmt::Display for RunHistoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] 新增 {}, 更新 {}, 跳过 {}, 失败 {}, 未完成 {}, 耗时 {}ms",
            self.outcome, self.created, self.updated, self.skipped, self.failed, self.abandoned, self.duration_ms
        )?;
        if let Some(error) = &self.error {
            write!(f, ", 错误: {}", error)?;
        }
        Ok(())
    }
}
