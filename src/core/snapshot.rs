//! 分享文件快照

use crate::core::share::ShareId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// 分享中的一个文件或目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 相对于分享根目录的路径分段，最后一段等于 `name`
    pub relative_path: Vec<String>,
    pub name: String,
    /// 远程文件标识，转存时使用
    pub remote_id: String,
    pub is_directory: bool,
    pub size: u64,
    /// 目录为空字符串
    #[serde(default)]
    pub checksum: String,
}

impl FileEntry {
    pub fn file(path: &str, remote_id: impl Into<String>, size: u64, checksum: impl Into<String>) -> Self {
        let relative_path = split_path(path);
        let name = relative_path.last().cloned().unwrap_or_default();
        Self {
            relative_path,
            name,
            remote_id: remote_id.into(),
            is_directory: false,
            size,
            checksum: checksum.into(),
        }
    }

    pub fn directory(path: &str, remote_id: impl Into<String>) -> Self {
        let relative_path = split_path(path);
        let name = relative_path.last().cloned().unwrap_or_default();
        Self {
            relative_path,
            name,
            remote_id: remote_id.into(),
            is_directory: true,
            size: 0,
            checksum: String::new(),
        }
    }

    /// 用 `/` 连接的路径，作为日志和比较的键
    pub fn path_key(&self) -> String {
        self.relative_path.join("/")
    }

    /// 所在目录的路径分段
    pub fn parent_segments(&self) -> &[String] {
        match self.relative_path.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 某一时刻分享的完整文件列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub share_id: ShareId,
    /// 乐观锁版本号，从未提交过的快照为 0
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<FileEntry>,
}

impl Snapshot {
    /// 由远程列表构建快照，重复的路径只保留第一次出现的条目
    pub fn from_listing(share_id: ShareId, listing: Vec<FileEntry>) -> Self {
        let mut seen = HashSet::with_capacity(listing.len());
        let mut entries = Vec::with_capacity(listing.len());

        for entry in listing {
            if seen.insert(entry.relative_path.clone()) {
                entries.push(entry);
            } else {
                warn!("分享 {} 中存在重复路径，已忽略: {}", share_id, entry.path_key());
            }
        }

        Self {
            share_id,
            version: 0,
            created_at: Utc::now(),
            entries,
        }
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_directory).count()
    }

    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_directory)
            .map(|e| e.size)
            .sum()
    }
}
