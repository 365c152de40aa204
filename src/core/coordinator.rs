//! 同步协调器：对单个分享执行一轮完整同步，并调度多个分享

use crate::core::diff::{diff, summarize_actions};
use crate::core::executor::{SyncExecutor, SyncResult, SyncStatus};
use crate::core::history::{RunHistoryRecord, RunOutcome};
use crate::core::share::{ResolvedShare, ShareConfig, ShareId};
use crate::core::snapshot::{FileEntry, Snapshot};
use crate::db::StateStore;
use crate::remote::ShareLister;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// 协调器参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// 每个分享保留的历史记录条数
    pub max_history: u32,
    /// 同时进行同步的分享数量
    pub max_parallel_shares: usize,
    /// 两次获取分享列表之间的最小间隔
    pub courtesy_delay: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_history: 1000,
            max_parallel_shares: 1,
            courtesy_delay: Duration::from_secs(1),
        }
    }
}

/// 一轮同步的结果
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// 需要提交（或已经提交）的快照，获取列表失败时为 None
    pub snapshot: Option<Snapshot>,
    pub results: Vec<SyncResult>,
    pub record: RunHistoryRecord,
}

/// 同步协调器
pub struct RunCoordinator {
    lister: Arc<dyn ShareLister>,
    store: Arc<dyn StateStore>,
    executor: SyncExecutor,
    settings: CoordinatorSettings,
    /// 上一次获取分享列表的时间
    last_fetch: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(lister: Arc<dyn ShareLister>, store: Arc<dyn StateStore>, executor: SyncExecutor) -> Self {
        Self {
            lister,
            store,
            executor,
            settings: CoordinatorSettings::default(),
            last_fetch: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 取消令牌同时传给执行器
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// 执行一轮同步：获取列表、比较、执行，生成要提交的快照和历史记录
    ///
    /// 不读写状态库。
    pub async fn run_cycle(&self, share: &ResolvedShare, previous: Option<Snapshot>) -> CycleOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();

        if self.cancel.is_cancelled() {
            return CycleOutcome {
                snapshot: None,
                results: Vec::new(),
                record: RunHistoryRecord::failed(
                    share.id.clone(),
                    started_at,
                    RunOutcome::Cancelled,
                    "同步已取消",
                    timer.elapsed(),
                ),
            };
        }

        self.pace().await;

        let listing = match self
            .lister
            .list_share(&share.share_ref, share.password.as_deref())
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                if e.is_transient() {
                    warn!("获取分享列表失败，下轮重试: {}", e);
                } else {
                    error!("获取分享列表失败，请检查配置: {}", e);
                }
                return CycleOutcome {
                    snapshot: None,
                    results: Vec::new(),
                    record: RunHistoryRecord::failed(
                        share.id.clone(),
                        started_at,
                        RunOutcome::FetchFailed,
                        e.to_string(),
                        timer.elapsed(),
                    ),
                };
            }
        };

        let current = Snapshot::from_listing(share.id.clone(), listing);
        let actions = diff(previous.as_ref(), &current, &share.config);
        let summary = summarize_actions(&actions);
        info!(
            "从 {} 获取 {} 个文件 ({} 字节): 新增 {}, 更新 {}, 跳过 {}, 待传输 {} 字节",
            self.lister.name(),
            current.file_count(),
            current.total_size(),
            summary.create_count,
            summary.update_count,
            summary.skip_count,
            summary.total_transfer_bytes()
        );

        let results = self.executor.execute(actions, share).await;
        let snapshot = reconcile(previous.as_ref(), current, &results);
        let record = RunHistoryRecord::from_results(share.id.clone(), started_at, &results, timer.elapsed());

        CycleOutcome {
            snapshot: Some(snapshot),
            results,
            record,
        }
    }

    /// 同步单个分享：读取上次快照，执行一轮，提交快照和历史
    pub async fn sync_share(&self, config: &ShareConfig) -> CycleOutcome {
        let share = match config.resolve() {
            Ok(share) => share,
            Err(e) => {
                error!("跳过无效的分享: {}", e);
                return CycleOutcome {
                    snapshot: None,
                    results: Vec::new(),
                    record: RunHistoryRecord::failed(
                        ShareId::from(config.url.clone()),
                        Utc::now(),
                        RunOutcome::FetchFailed,
                        e.to_string(),
                        Duration::ZERO,
                    ),
                };
            }
        };

        let span = info_span!("cycle", share = %share.id);
        self.sync_resolved(&share).instrument(span).await
    }

    async fn sync_resolved(&self, share: &ResolvedShare) -> CycleOutcome {
        let previous = match self.store.load_snapshot(&share.id).await {
            Ok(previous) => previous,
            Err(e) => {
                error!("读取上次快照失败: {}", e);
                let outcome = CycleOutcome {
                    snapshot: None,
                    results: Vec::new(),
                    record: RunHistoryRecord::failed(
                        share.id.clone(),
                        Utc::now(),
                        RunOutcome::StoreFailed,
                        e.to_string(),
                        Duration::ZERO,
                    ),
                };
                self.record_only(&outcome.record).await;
                return outcome;
            }
        };

        if previous.is_none() {
            info!("首次同步该分享，将转存全部文件");
        }

        let mut outcome = self.run_cycle(share, previous).await;

        match outcome.snapshot.take() {
            Some(snapshot) => {
                match self
                    .store
                    .commit_cycle(&snapshot, &outcome.record, self.settings.max_history)
                    .await
                {
                    Ok(committed) => outcome.snapshot = Some(committed),
                    Err(e) => {
                        // 上一次快照保持不变，下轮从同一基线重新比较
                        error!("提交同步状态失败: {}", e);
                        outcome.record.outcome = RunOutcome::StoreFailed;
                        outcome.record.error = Some(e.to_string());
                        self.record_only(&outcome.record).await;
                    }
                }
            }
            None => self.record_only(&outcome.record).await,
        }

        log_summary(&outcome.record);
        outcome
    }

    /// 只写入历史记录，失败时仅记录日志
    async fn record_only(&self, record: &RunHistoryRecord) {
        if let Err(e) = self.store.append_history(record, self.settings.max_history).await {
            warn!("写入历史记录失败: {}", e);
        }
    }

    /// 同步所有启用的分享，单个分享失败不影响其他分享
    pub async fn run_all(&self, shares: &[ShareConfig]) -> Vec<(ShareConfig, CycleOutcome)> {
        let enabled: Vec<&ShareConfig> = shares.iter().filter(|s| s.enabled).collect();
        info!(
            "开始检查 {} 个分享（已禁用 {} 个）",
            enabled.len(),
            shares.len() - enabled.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_shares.max(1)));
        let tasks = enabled.into_iter().map(|config| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if self.cancel.is_cancelled() {
                    return None;
                }
                Some((config.clone(), self.sync_share(config).await))
            }
        });

        let outcomes: Vec<_> = futures::future::join_all(tasks).await.into_iter().flatten().collect();

        let succeeded = outcomes.iter().filter(|(_, o)| o.record.outcome.is_success()).count();
        info!(
            "本轮检查完成: {} 个分享, 成功 {}, 未完全成功 {}",
            outcomes.len(),
            succeeded,
            outcomes.len() - succeeded
        );

        outcomes
    }

    /// 两次获取列表之间至少间隔 `courtesy_delay`
    async fn pace(&self) {
        if self.settings.courtesy_delay.is_zero() {
            return;
        }

        let mut last_fetch = self.last_fetch.lock().await;
        if let Some(last) = *last_fetch {
            let ready_at = last + self.settings.courtesy_delay;
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        *last_fetch = Some(Instant::now());
    }
}

/// 生成本轮要提交的快照
///
/// 成功或跳过的文件使用当前条目；失败或未执行的文件保留上一次的条目（没有则不记录），
/// 下一轮会重新比较它们。只存在于上一次快照中的条目原样保留。
pub fn reconcile(previous: Option<&Snapshot>, current: Snapshot, results: &[SyncResult]) -> Snapshot {
    let statuses: HashMap<&[String], SyncStatus> = results
        .iter()
        .map(|r| (r.relative_path.as_slice(), r.status))
        .collect();
    let previous_index: HashMap<&[String], &FileEntry> = previous
        .map(|s| s.entries.iter().map(|e| (e.relative_path.as_slice(), e)).collect())
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(current.entries.len());
    let mut current_paths: HashSet<Vec<String>> = HashSet::with_capacity(current.entries.len());

    for entry in current.entries {
        current_paths.insert(entry.relative_path.clone());

        if entry.is_directory {
            entries.push(entry);
            continue;
        }

        match statuses.get(entry.relative_path.as_slice()) {
            Some(SyncStatus::Succeeded) | Some(SyncStatus::Skipped) => entries.push(entry),
            _ => {
                if let Some(prev) = previous_index.get(entry.relative_path.as_slice()) {
                    entries.push((*prev).clone());
                }
            }
        }
    }

    // 远程已删除的条目
    if let Some(previous) = previous {
        entries.extend(
            previous
                .entries
                .iter()
                .filter(|e| !current_paths.contains(&e.relative_path))
                .cloned(),
        );
    }

    Snapshot {
        share_id: current.share_id,
        version: previous.map(|s| s.version).unwrap_or(0),
        created_at: current.created_at,
        entries,
    }
}

fn log_summary(record: &RunHistoryRecord) {
    match record.outcome {
        RunOutcome::Succeeded => info!("同步完成 {}", record),
        _ => warn!("同步未完全成功 {}", record),
    }
    if !record.failed_paths.is_empty() {
        warn!("失败的文件: {}", record.failed_paths.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::ActionKind;
    use crate::core::executor::ConcurrencyStrategy;
    use crate::core::retry::RetryPolicy;
    use crate::core::share::ShareRef;
    use crate::db::SqliteStateStore;
    use crate::error::{PermanentKind, RemoteError, StoreError, TransferError};
    use crate::remote::{FileTransfer, TransferRequest};
    use async_trait::async_trait;

    fn result(path: &str, status: SyncStatus) -> SyncResult {
        SyncResult {
            relative_path: path.split('/').map(str::to_string).collect(),
            kind: ActionKind::Create,
            status,
            attempt_count: 1,
            error: None,
            duration: Duration::ZERO,
            stored_as: None,
        }
    }

    #[test]
    fn test_reconcile_keeps_baseline_for_failures() {
        let id = ShareId::new("k", None);
        let mut previous = Snapshot::from_listing(
            id.clone(),
            vec![
                FileEntry::file("changed-ok", "1", 1, "old"),
                FileEntry::file("changed-bad", "2", 1, "old"),
                FileEntry::file("deleted", "3", 1, "gone"),
            ],
        );
        previous.version = 4;
        let current = Snapshot::from_listing(
            id,
            vec![
                FileEntry::directory("dir", "d"),
                FileEntry::file("changed-ok", "1", 1, "new"),
                FileEntry::file("changed-bad", "2", 1, "new"),
                FileEntry::file("new-bad", "4", 1, "n"),
                FileEntry::file("new-cancelled", "5", 1, "c"),
            ],
        );
        let results = vec![
            result("changed-ok", SyncStatus::Succeeded),
            result("changed-bad", SyncStatus::FailedPermanently),
            result("new-bad", SyncStatus::FailedPermanently),
            result("new-cancelled", SyncStatus::Abandoned),
        ];

        let snapshot = reconcile(Some(&previous), current, &results);

        assert_eq!(snapshot.version, 4);
        let entries: Vec<_> = snapshot
            .entries
            .iter()
            .map(|e| (e.path_key(), e.checksum.as_str()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("dir".to_string(), ""),
                ("changed-ok".to_string(), "new"),
                ("changed-bad".to_string(), "old"),
                ("deleted".to_string(), "gone"),
            ]
        );
    }

    struct FixedLister(Vec<FileEntry>);

    #[async_trait]
    impl ShareLister for FixedLister {
        async fn list_share(&self, _share: &ShareRef, _password: Option<&str>) -> Result<Vec<FileEntry>, RemoteError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct DownLister;

    #[async_trait]
    impl ShareLister for DownLister {
        async fn list_share(&self, _share: &ShareRef, _password: Option<&str>) -> Result<Vec<FileEntry>, RemoteError> {
            Err(RemoteError::Unavailable("503".into()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    /// 名字以 bad 开头的文件总是失败
    struct PickyTransfer;

    #[async_trait]
    impl FileTransfer for PickyTransfer {
        async fn exists(&self, _folder: &str, _name: &str) -> Result<bool, TransferError> {
            Ok(false)
        }

        async fn transfer(&self, request: &TransferRequest<'_>) -> Result<(), TransferError> {
            if request.name.starts_with("bad") {
                Err(TransferError::permanent(PermanentKind::Denied, request.name))
            } else {
                Ok(())
            }
        }
    }

    /// 提交总是失败的状态库
    struct BrokenCommitStore(SqliteStateStore);

    #[async_trait]
    impl StateStore for BrokenCommitStore {
        async fn load_snapshot(&self, share_id: &ShareId) -> Result<Option<Snapshot>, StoreError> {
            self.0.load_snapshot(share_id).await
        }
        async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot, StoreError> {
            self.0.save_snapshot(snapshot).await
        }
        async fn append_history(&self, record: &RunHistoryRecord, max_history: u32) -> Result<(), StoreError> {
            self.0.append_history(record, max_history).await
        }
        async fn commit_cycle(
            &self,
            snapshot: &Snapshot,
            _record: &RunHistoryRecord,
            _max_history: u32,
        ) -> Result<Snapshot, StoreError> {
            Err(StoreError::VersionConflict {
                share_id: snapshot.share_id.to_string(),
                expected: snapshot.version,
            })
        }
        async fn recent_history(&self, share_id: &ShareId, limit: u32) -> Result<Vec<RunHistoryRecord>, StoreError> {
            self.0.recent_history(share_id, limit).await
        }
        async fn forget_share(&self, share_id: &ShareId) -> Result<(), StoreError> {
            self.0.forget_share(share_id).await
        }
    }

    fn coordinator(lister: Arc<dyn ShareLister>, store: Arc<dyn StateStore>) -> RunCoordinator {
        let executor = SyncExecutor::new(Arc::new(PickyTransfer), ConcurrencyStrategy::Inline, RetryPolicy::none());
        RunCoordinator::new(lister, store, executor).with_settings(CoordinatorSettings {
            max_history: 5,
            max_parallel_shares: 2,
            courtesy_delay: Duration::ZERO,
        })
    }

    fn listing() -> Vec<FileEntry> {
        vec![
            FileEntry::file("good.txt", "1", 1, "g"),
            FileEntry::file("bad.txt", "2", 1, "b"),
        ]
    }

    #[tokio::test]
    async fn test_partial_failure_retries_only_failed_file() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let coordinator = coordinator(Arc::new(FixedLister(listing())), store.clone());
        let share = ShareConfig::new("https://h/s/k", "dst");

        let first = coordinator.sync_share(&share).await;
        assert_eq!(first.record.outcome, RunOutcome::PartiallySucceeded);
        assert_eq!(first.record.created, 1);
        assert_eq!(first.record.failed_paths, vec!["bad.txt"]);
        assert_eq!(first.snapshot.as_ref().unwrap().version, 1);

        let second = coordinator.sync_share(&share).await;
        let attempted: Vec<_> = second
            .results
            .iter()
            .filter(|r| r.status != SyncStatus::Skipped)
            .map(|r| r.path_key())
            .collect();
        assert_eq!(attempted, vec!["bad.txt"]);
        assert_eq!(second.record.skipped, 1);

        let id = share.resolve().unwrap().id;
        assert_eq!(store.recent_history(&id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_snapshot() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let share = ShareConfig::new("https://h/s/k", "dst");
        coordinator(Arc::new(FixedLister(listing())), store.clone())
            .sync_share(&share)
            .await;

        let outcome = coordinator(Arc::new(DownLister), store.clone()).sync_share(&share).await;

        assert_eq!(outcome.record.outcome, RunOutcome::FetchFailed);
        assert!(outcome.snapshot.is_none());
        let id = share.resolve().unwrap().id;
        assert_eq!(store.load_snapshot(&id).await.unwrap().unwrap().version, 1);
        let history = store.recent_history(&id, 10).await.unwrap();
        assert_eq!(history.last().unwrap().outcome, RunOutcome::FetchFailed);
    }

    #[tokio::test]
    async fn test_commit_failure_is_recorded() {
        let inner = SqliteStateStore::in_memory().await.unwrap();
        let store = Arc::new(BrokenCommitStore(inner.clone()));
        let share = ShareConfig::new("https://h/s/k", "dst");

        let outcome = coordinator(Arc::new(FixedLister(listing())), store).sync_share(&share).await;

        assert_eq!(outcome.record.outcome, RunOutcome::StoreFailed);
        assert!(outcome.snapshot.is_none());
        let id = share.resolve().unwrap().id;
        assert!(inner.load_snapshot(&id).await.unwrap().is_none());
        assert_eq!(
            inner.recent_history(&id, 10).await.unwrap()[0].outcome,
            RunOutcome::StoreFailed
        );
    }

    #[tokio::test]
    async fn test_run_all_skips_disabled_and_isolates_failures() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let coordinator = coordinator(Arc::new(FixedLister(listing())), store.clone());

        let mut disabled = ShareConfig::new("https://h/s/off", "dst");
        disabled.enabled = false;
        let shares = vec![
            ShareConfig::new("not a share link", "dst"),
            disabled.clone(),
            ShareConfig::new("https://h/s/on", "dst"),
        ];

        let outcomes = coordinator.run_all(&shares).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].1.record.outcome, RunOutcome::FetchFailed);
        assert_eq!(outcomes[1].1.record.created, 1);
        let off = disabled.resolve().unwrap().id;
        assert!(store.recent_history(&off, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_coordinator_runs_nothing() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let cancel = CancellationToken::new();
        let coordinator =
            coordinator(Arc::new(FixedLister(listing())), store).with_cancellation(cancel.clone());
        cancel.cancel();

        let outcomes = coordinator.run_all(&[ShareConfig::new("https://h/s/k", "dst")]).await;
        assert!(outcomes.is_empty());

        let outcome = coordinator
            .run_cycle(&ShareConfig::new("https://h/s/k", "dst").resolve().unwrap(), None)
            .await;
        assert_eq!(outcome.record.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_courtesy_delay_between_fetches() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let executor = SyncExecutor::new(Arc::new(PickyTransfer), ConcurrencyStrategy::Inline, RetryPolicy::none());
        let coordinator = RunCoordinator::new(Arc::new(FixedLister(Vec::new())), store, executor).with_settings(
            CoordinatorSettings {
                max_history: 5,
                max_parallel_shares: 4,
                courtesy_delay: Duration::from_secs(1),
            },
        );
        let share = ShareConfig::new("https://h/s/k", "dst").resolve().unwrap();

        let start = Instant::now();
        coordinator.run_cycle(&share, None).await;
        coordinator.run_cycle(&share, None).await;
        coordinator.run_cycle(&share, None).await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
