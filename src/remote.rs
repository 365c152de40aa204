//! 远程能力接口：列出分享文件、转存单个文件

use crate::core::share::ShareRef;
use crate::core::snapshot::FileEntry;
use crate::error::{RemoteError, TransferError};
use async_trait::async_trait;

/// 获取分享的完整文件列表
#[async_trait]
pub trait ShareLister: Send + Sync {
    /// 递归列出分享中的所有文件和目录
    async fn list_share(&self, share: &ShareRef, password: Option<&str>) -> Result<Vec<FileEntry>, RemoteError>;

    /// 用于日志
    fn name(&self) -> &str;
}

/// 一次转存请求
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub share: &'a ShareRef,
    pub password: Option<&'a str>,
    pub entry: &'a FileEntry,
    /// 目标文件夹
    pub folder: &'a str,
    /// 目标文件名，可能已被加上去重后缀
    pub name: &'a str,
    /// 为 true 时必须原子地替换已有文件
    pub overwrite: bool,
}

/// 把分享中的文件复制到目标网盘
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// 目标文件夹中是否已有同名条目
    async fn exists(&self, folder: &str, name: &str) -> Result<bool, TransferError>;

    /// 复制整个文件。`overwrite = false` 且目标已存在时返回 `AlreadyExists`
    async fn transfer(&self, request: &TransferRequest<'_>) -> Result<(), TransferError>;
}
