//! 同步执行器：按并发策略执行同步动作，处理重试和重名

use crate::core::diff::{ActionKind, SyncAction, TargetPlacement};
use crate::core::retry::RetryPolicy;
use crate::core::share::{DuplicatePolicy, ResolvedShare};
use crate::core::snapshot::FileEntry;
use crate::error::{PermanentKind, TransferError};
use crate::remote::{FileTransfer, TransferRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// keep-both 模式下最多尝试的候选文件名数量
const MAX_NAME_PROBES: u32 = 1000;

/// 执行并发策略，在构造执行器时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyStrategy {
    /// 在当前任务中逐个执行
    Inline,
    /// 每个动作一个任务
    Unbounded,
    /// 固定大小的任务池
    Bounded(NonZeroUsize),
}

impl ConcurrencyStrategy {
    /// 解析 `thread_pool_size` 配置：0 顺序执行，负数不限制，正数为池大小
    pub fn from_pool_size(size: i64) -> Self {
        match size {
            0 => ConcurrencyStrategy::Inline,
            n if n < 0 => ConcurrencyStrategy::Unbounded,
            n => NonZeroUsize::new(usize::try_from(n).unwrap_or(usize::MAX))
                .map(ConcurrencyStrategy::Bounded)
                .unwrap_or(ConcurrencyStrategy::Inline),
        }
    }
}

/// 单个动作的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Succeeded,
    FailedPermanently,
    Skipped,
    /// 因取消而未执行完，下一轮会重新比较
    Abandoned,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub relative_path: Vec<String>,
    pub kind: ActionKind,
    pub status: SyncStatus,
    /// 实际调用转存的次数，跳过的动作为 0
    pub attempt_count: u32,
    /// 仅在 `FailedPermanently` 时存在
    pub error: Option<String>,
    pub duration: Duration,
    /// keep-both 模式下实际使用的文件名（与原名不同时）
    pub stored_as: Option<String>,
}

impl SyncResult {
    fn new(entry: &FileEntry, kind: ActionKind, status: SyncStatus) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            kind,
            status,
            attempt_count: 0,
            error: None,
            duration: Duration::ZERO,
            stored_as: None,
        }
    }

    pub fn path_key(&self) -> String {
        self.relative_path.join("/")
    }
}

/// 同步执行器
///
/// 执行器本身不保存任何状态，单个动作的失败只记录在结果中，不会中断其他动作。
#[derive(Clone)]
pub struct SyncExecutor {
    transfer: Arc<dyn FileTransfer>,
    strategy: ConcurrencyStrategy,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl SyncExecutor {
    pub fn new(transfer: Arc<dyn FileTransfer>, strategy: ConcurrencyStrategy, retry: RetryPolicy) -> Self {
        Self {
            transfer,
            strategy,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// 使用外部的取消令牌
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 执行一组动作，返回与提交顺序一致的结果
    pub async fn execute(&self, actions: Vec<SyncAction>, share: &ResolvedShare) -> Vec<SyncResult> {
        if actions.is_empty() {
            return Vec::new();
        }

        match self.strategy {
            ConcurrencyStrategy::Inline => {
                let mut results = Vec::with_capacity(actions.len());
                for action in &actions {
                    results.push(self.run_action(action, share).await);
                }
                results
            }
            ConcurrencyStrategy::Unbounded => self.execute_parallel(actions, share, None).await,
            ConcurrencyStrategy::Bounded(size) => {
                let semaphore = Arc::new(Semaphore::new(size.get()));
                self.execute_parallel(actions, share, Some(semaphore)).await
            }
        }
    }

    /// 并行执行，结果按下标写回共享集合
    ///
    /// 目标路径相同的动作分到同一组，在一个任务中按提交顺序执行，
    /// 不同目标的动作之间仍然并行。
    async fn execute_parallel(
        &self,
        actions: Vec<SyncAction>,
        share: &ResolvedShare,
        semaphore: Option<Arc<Semaphore>>,
    ) -> Vec<SyncResult> {
        let total = actions.len();
        let share = Arc::new(share.clone());
        let collected = Arc::new(Mutex::new(Vec::<(usize, SyncResult)>::with_capacity(total)));
        let placeholders: Vec<(FileEntry, ActionKind)> =
            actions.iter().map(|a| (a.entry().clone(), a.kind())).collect();

        let mut groups: Vec<Vec<(usize, SyncAction)>> = Vec::new();
        let mut group_of: HashMap<(String, String), usize> = HashMap::new();

        for (index, action) in actions.into_iter().enumerate() {
            let key = match action.target() {
                Some(target) => (target.folder.clone(), target.name.clone()),
                // 跳过的动作不占用任务池
                None => {
                    let result = SyncResult::new(action.entry(), ActionKind::Skip, SyncStatus::Skipped);
                    collected.lock().await.push((index, result));
                    continue;
                }
            };

            match group_of.get(&key) {
                Some(&group) => groups[group].push((index, action)),
                None => {
                    group_of.insert(key, groups.len());
                    groups.push(vec![(index, action)]);
                }
            }
        }

        let mut handles = Vec::with_capacity(groups.len());

        for group in groups {
            let permit = match &semaphore {
                Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                None => None,
            };
            let executor = self.clone();
            let share = share.clone();
            let collected = collected.clone();

            handles.push(tokio::spawn(async move {
                for (index, action) in group {
                    let result = executor.run_action(&action, &share).await;
                    collected.lock().await.push((index, result));
                }
                drop(permit);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("同步任务异常退出: {}", e);
            }
        }

        let mut ordered: Vec<Option<SyncResult>> = vec![None; total];
        for (index, result) in std::mem::take(&mut *collected.lock().await) {
            ordered[index] = Some(result);
        }

        ordered
            .into_iter()
            .zip(placeholders)
            .map(|(result, (entry, kind))| {
                result.unwrap_or_else(|| {
                    let mut failed = SyncResult::new(&entry, kind, SyncStatus::FailedPermanently);
                    failed.error = Some("同步任务异常退出".to_string());
                    failed
                })
            })
            .collect()
    }

    /// 执行单个动作，包含重试
    async fn run_action(&self, action: &SyncAction, share: &ResolvedShare) -> SyncResult {
        let (entry, target) = match action {
            SyncAction::Skip { entry, .. } => {
                return SyncResult::new(entry, ActionKind::Skip, SyncStatus::Skipped);
            }
            SyncAction::Create { entry, target } | SyncAction::Update { entry, target, .. } => (entry, target),
        };

        let kind = action.kind();
        let mut result = SyncResult::new(entry, kind, SyncStatus::Abandoned);

        if self.cancel.is_cancelled() {
            debug!("已取消，跳过: {}", entry.path_key());
            return result;
        }

        let start = Instant::now();

        loop {
            result.attempt_count += 1;

            match self.attempt(kind, entry, target, share).await {
                Ok(stored_as) => {
                    if let Some(name) = &stored_as {
                        info!("{} 已存在，另存为 {}", entry.path_key(), name);
                    }
                    debug!("转存完成: {} -> {}/{}", entry.path_key(), target.folder, target.name);
                    result.status = SyncStatus::Succeeded;
                    result.stored_as = stored_as;
                    break;
                }
                Err(e) if self.retry.should_retry(&e, result.attempt_count) => {
                    let delay = self.retry.delay_before(result.attempt_count);
                    warn!(
                        "转存失败，{}ms 后重试 ({}/{}): {}: {}",
                        delay.as_millis(),
                        result.attempt_count,
                        self.retry.max_retries,
                        entry.path_key(),
                        e
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            warn!("等待重试时被取消: {}", entry.path_key());
                            result.status = SyncStatus::Abandoned;
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "转存最终失败 (共尝试{}次): {}: {}",
                        result.attempt_count,
                        entry.path_key(),
                        e
                    );
                    result.status = SyncStatus::FailedPermanently;
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }

        result.duration = start.elapsed();
        result
    }

    /// 一次转存尝试，返回改名后的文件名（如有）
    async fn attempt(
        &self,
        kind: ActionKind,
        entry: &FileEntry,
        target: &TargetPlacement,
        share: &ResolvedShare,
    ) -> Result<Option<String>, TransferError> {
        let collides = match kind {
            ActionKind::Update => true,
            _ => target.collision.is_some() || self.transfer.exists(&target.folder, &target.name).await?,
        };

        if !collides {
            match self.send(share, entry, &target.folder, &target.name, false).await {
                // 检查之后目标才出现，按重名处理
                Err(e) if e.is_already_exists() => {
                    debug!("目标已存在: {}/{}", target.folder, target.name);
                }
                other => return other.map(|_| None),
            }
        }

        match share.config.duplicate {
            DuplicatePolicy::Overwrite => self
                .send(share, entry, &target.folder, &target.name, true)
                .await
                .map(|_| None),
            DuplicatePolicy::KeepBoth => {
                let mut index = 0;
                loop {
                    let (found, name) = self.free_name(&target.folder, &target.name, index).await?;
                    match self.send(share, entry, &target.folder, &name, false).await {
                        Ok(()) => return Ok((name != target.name).then_some(name)),
                        Err(e) if e.is_already_exists() => index = found + 1,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// 从第 `from` 个候选开始，找到目标文件夹中第一个未被占用的文件名
    async fn free_name(&self, folder: &str, name: &str, from: u32) -> Result<(u32, String), TransferError> {
        for index in from..MAX_NAME_PROBES {
            let candidate = disambiguate(name, index);
            if !self.transfer.exists(folder, &candidate).await? {
                return Ok((index, candidate));
            }
        }

        Err(TransferError::permanent(
            PermanentKind::AlreadyExists,
            format!("{}/{} 没有可用的文件名", folder, name),
        ))
    }

    async fn send(
        &self,
        share: &ResolvedShare,
        entry: &FileEntry,
        folder: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        let request = TransferRequest {
            share: &share.share_ref,
            password: share.password.as_deref(),
            entry,
            folder,
            name,
            overwrite,
        };
        self.transfer.transfer(&request).await
    }
}

/// 第 `index` 个候选文件名：`a.txt`、`a (1).txt`、`a (2).txt` ...
pub fn disambiguate(name: &str, index: u32) -> String {
    if index == 0 {
        return name.to_string();
    }

    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, index, ext),
        _ => format!("{} ({})", name, index),
    }
}
