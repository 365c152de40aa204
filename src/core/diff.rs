//! 快照比较，生成同步动作

use crate::core::share::{DuplicatePolicy, ShareConfig};
use crate::core::snapshot::{FileEntry, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// 文件在目标端的落点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlacement {
    /// 目标文件夹，`target_folder_id` 加上（可选的）目录分段
    pub folder: String,
    pub name: String,
    /// 平铺模式下与本快照中更早的文件重名时，记录应采用的重名策略
    pub collision: Option<DuplicatePolicy>,
}

/// 同步动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// 新文件
    Create {
        entry: FileEntry,
        target: TargetPlacement,
    },
    /// 内容变化的文件
    Update {
        entry: FileEntry,
        target: TargetPlacement,
        previous_checksum: String,
    },
    /// 跳过
    Skip { entry: FileEntry, reason: String },
}

impl SyncAction {
    pub fn entry(&self) -> &FileEntry {
        match self {
            SyncAction::Create { entry, .. }
            | SyncAction::Update { entry, .. }
            | SyncAction::Skip { entry, .. } => entry,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::Create { .. } => ActionKind::Create,
            SyncAction::Update { .. } => ActionKind::Update,
            SyncAction::Skip { .. } => ActionKind::Skip,
        }
    }

    pub fn target(&self) -> Option<&TargetPlacement> {
        match self {
            SyncAction::Create { target, .. } | SyncAction::Update { target, .. } => Some(target),
            SyncAction::Skip { .. } => None,
        }
    }
}

/// 动作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Skip,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Update => write!(f, "update"),
            ActionKind::Skip => write!(f, "skip"),
        }
    }
}

/// 比较上一次快照和当前快照，按当前快照的条目顺序生成动作
///
/// 目录不产生动作；只存在于上一次快照中的文件（远程已删除）也不产生动作。
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot, share: &ShareConfig) -> Vec<SyncAction> {
    let previous_index: HashMap<&[String], &FileEntry> = previous
        .map(|s| {
            s.entries
                .iter()
                .filter(|e| !e.is_directory)
                .map(|e| (e.relative_path.as_slice(), e))
                .collect()
        })
        .unwrap_or_default();

    let mut flat_names: HashSet<&str> = HashSet::new();
    let mut actions = Vec::with_capacity(current.entries.len());

    for entry in current.entries.iter().filter(|e| !e.is_directory) {
        let target = place(entry, share, &mut flat_names);

        let action = match previous_index.get(entry.relative_path.as_slice()) {
            None => SyncAction::Create {
                entry: entry.clone(),
                target,
            },
            // 空 checksum 无法判断是否变化，按已变化处理
            Some(prev) if prev.checksum.is_empty() || entry.checksum.is_empty() || prev.checksum != entry.checksum => {
                SyncAction::Update {
                    entry: entry.clone(),
                    target,
                    previous_checksum: prev.checksum.clone(),
                }
            }
            Some(_) => SyncAction::Skip {
                entry: entry.clone(),
                reason: "unchanged".to_string(),
            },
        };

        actions.push(action);
    }

    actions
}

fn place<'a>(entry: &'a FileEntry, share: &ShareConfig, flat_names: &mut HashSet<&'a str>) -> TargetPlacement {
    if share.preserve_path {
        let mut folder = share.target_folder_id.trim_end_matches('/').to_string();
        for segment in entry.parent_segments() {
            folder.push('/');
            folder.push_str(segment);
        }
        return TargetPlacement {
            folder,
            name: entry.name.clone(),
            collision: None,
        };
    }

    // 平铺模式下不同目录的同名文件会落到同一位置
    let collision = if flat_names.insert(entry.name.as_str()) {
        None
    } else {
        Some(share.duplicate)
    };

    TargetPlacement {
        folder: share.target_folder_id.trim_end_matches('/').to_string(),
        name: entry.name.clone(),
        collision,
    }
}

/// 统计同步动作
pub fn summarize_actions(actions: &[SyncAction]) -> ActionSummary {
    let mut summary = ActionSummary::default();

    for action in actions {
        let size = action.entry().size;
        match action {
            SyncAction::Create { .. } => {
                summary.create_count += 1;
                summary.create_bytes += size;
            }
            SyncAction::Update { .. } => {
                summary.update_count += 1;
                summary.update_bytes += size;
            }
            SyncAction::Skip { .. } => summary.skip_count += 1,
        }
    }

    summary
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub create_count: usize,
    pub create_bytes: u64,
    pub update_count: usize,
    pub update_bytes: u64,
    pub skip_count: usize,
}

impl ActionSummary {
    pub fn total_files(&self) -> usize {
        self.create_count + self.update_count + self.skip_count
    }

    pub fn total_transfer_bytes(&self) -> u64 {
        self.create_bytes + self.update_bytes
    }
}
