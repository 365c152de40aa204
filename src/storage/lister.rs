use super::{build_operator, calculate_hash, to_remote_error, StorageConfig};
use crate::core::share::ShareRef;
use crate::core::snapshot::FileEntry;
use crate::error::RemoteError;
use crate::remote::ShareLister;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{ErrorKind, Metakey, Operator};
use tracing::{debug, warn};

/// 分享目录中保存提取码的文件，不会出现在文件列表中
pub const PASSWORD_FILE: &str = ".sharepwd";

/// 把存储中的 `<key>/` 目录当作一个分享
pub struct StorageShareLister {
    operator: Operator,
    name: String,
}

impl StorageShareLister {
    pub fn new(operator: Operator, name: impl Into<String>) -> Self {
        Self {
            operator,
            name: name.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_operator(config)?, config.display_name()))
    }

    /// 分享目录中有提取码文件时，要求提取码一致
    async fn check_password(&self, root: &str, password: Option<&str>) -> Result<(), RemoteError> {
        let path = format!("{}{}", root, PASSWORD_FILE);
        let expected = match self.operator.read(&path).await {
            Ok(data) => String::from_utf8_lossy(&data.to_vec()).trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(to_remote_error(e)),
        };

        if password.unwrap_or_default() != expected {
            return Err(RemoteError::Auth(format!("提取码错误: {}", root.trim_end_matches('/'))));
        }
        Ok(())
    }

    /// 后端没有提供摘要时读取全部内容计算，文件在列出后被删除时返回 None
    async fn hash_content(&self, path: &str) -> Result<Option<String>, RemoteError> {
        match self.operator.read(path).await {
            Ok(data) => Ok(Some(calculate_hash(&data.to_vec()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(to_remote_error(e)),
        }
    }
}

#[async_trait]
impl ShareLister for StorageShareLister {
    async fn list_share(&self, share: &ShareRef, password: Option<&str>) -> Result<Vec<FileEntry>, RemoteError> {
        let root = format!("{}/", share.key);
        self.check_password(&root, password).await?;

        let mut lister = self
            .operator
            .lister_with(&root)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::Mode | Metakey::ContentMd5 | Metakey::Etag)
            .await
            .map_err(to_remote_error)?;

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await.map_err(to_remote_error)? {
            let full_path = entry.path().to_string();
            let relative = full_path
                .strip_prefix(&root)
                .unwrap_or(&full_path)
                .trim_matches('/')
                .to_string();

            // 跳过根目录和提取码文件
            if relative.is_empty() || relative == PASSWORD_FILE {
                continue;
            }

            let meta = entry.metadata();
            if meta.is_dir() {
                entries.push(FileEntry::directory(&relative, full_path));
                continue;
            }

            let checksum = match meta.content_md5().or(meta.etag()) {
                Some(sum) => sum.trim_matches('"').to_string(),
                None => match self.hash_content(&full_path).await? {
                    Some(sum) => sum,
                    None => {
                        warn!("文件在列出后被删除，本轮跳过: {}", full_path);
                        continue;
                    }
                },
            };
            entries.push(FileEntry::file(&relative, full_path, meta.content_length(), checksum));
        }

        if entries.is_empty() {
            return Err(RemoteError::NotFound(format!("{} 中没有分享 {}", self.name, share.key)));
        }

        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!("列出分享 {}: {} 个条目", share.key, entries.len());
        Ok(entries)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
