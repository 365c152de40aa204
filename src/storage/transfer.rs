use super::{build_operator, to_transfer_error, StorageConfig};
use crate::error::{PermanentKind, TransferError};
use crate::remote::{FileTransfer, TransferRequest};
use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 从来源存储读取文件，写入目标存储的 `<folder>/<name>`
pub struct StorageTransfer {
    source: Operator,
    destination: Operator,
    /// 不覆盖写入时按目标路径加锁，检查和写入之间不会被同一进程的其他写入插入
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StorageTransfer {
    pub fn new(source: Operator, destination: Operator) -> Self {
        Self {
            source,
            destination,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(source: &StorageConfig, destination: &StorageConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_operator(source)?, build_operator(destination)?))
    }

    pub fn destination(&self) -> &Operator {
        &self.destination
    }

    async fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        // 清理已经没有人持有的锁
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(path.to_string()).or_default().clone()
    }

    async fn stat_exists(&self, path: &str) -> Result<bool, TransferError> {
        match self.destination.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(to_transfer_error(e)),
        }
    }
}

fn dest_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

#[async_trait]
impl FileTransfer for StorageTransfer {
    async fn exists(&self, folder: &str, name: &str) -> Result<bool, TransferError> {
        self.stat_exists(&dest_path(folder, name)).await
    }

    async fn transfer(&self, request: &TransferRequest<'_>) -> Result<(), TransferError> {
        let path = dest_path(request.folder, request.name);

        let lock = self.path_lock(&path).await;
        let _guard = lock.lock().await;

        if !request.overwrite && self.stat_exists(&path).await? {
            return Err(TransferError::permanent(PermanentKind::AlreadyExists, path));
        }

        let data = self
            .source
            .read(&request.entry.remote_id)
            .await
            .map_err(to_transfer_error)?;

        let folder = request.folder.trim_matches('/');
        if !folder.is_empty() {
            // 部分后端需要先创建目录，已存在时忽略
            if let Err(e) = self.destination.create_dir(&format!("{}/", folder)).await {
                debug!("创建目录失败（忽略）: {}: {}", folder, e);
            }
        }

        debug!("转存: {} -> {} ({}字节)", request.entry.remote_id, path, data.len());
        let conditional = !request.overwrite
            && self
                .destination
                .info()
                .full_capability()
                .write_with_if_none_match;

        let written = if conditional {
            // 其他进程在检查之后写入了同名文件时由后端拒绝
            self.destination.write_with(&path, data).if_none_match("*").await
        } else {
            self.destination.write(&path, data).await
        };

        match written {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConditionNotMatch => {
                Err(TransferError::permanent(PermanentKind::AlreadyExists, path))
            }
            Err(e) => Err(to_transfer_error(e)),
        }
    }
}
