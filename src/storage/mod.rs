//! 基于 opendal 的存储适配：把发布目录当作分享来源，把目标存储当作网盘

pub mod checksum;
pub mod lister;
pub mod transfer;

use crate::error::{PermanentKind, RemoteError, TransferError, TransientKind};
use anyhow::Result;
use opendal::{layers::TimeoutLayer, ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use checksum::calculate_hash;
pub use lister::StorageShareLister;
pub use transfer::StorageTransfer;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, list 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
    /// 进程内存储，用于测试和演练
    Memory,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self::of(StorageType::Local).with_path(path)
    }

    pub fn memory() -> Self {
        Self::of(StorageType::Memory)
    }

    fn of(typ: StorageType) -> Self {
        Self {
            typ,
            path: None,
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            prefix: None,
            webdav_endpoint: None,
            username: None,
            password: None,
            root: None,
        }
    }

    fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 用于日志的存储名称
    pub fn display_name(&self) -> String {
        match self.typ {
            StorageType::Local => format!("local:{}", self.path.as_deref().unwrap_or_default()),
            StorageType::S3 => format!(
                "s3://{}{}",
                self.bucket.as_deref().unwrap_or_default(),
                self.prefix
                    .as_deref()
                    .map(|p| format!("/{}", p))
                    .unwrap_or_default()
            ),
            StorageType::WebDav => format!(
                "webdav://{}{}",
                self.webdav_endpoint
                    .as_deref()
                    .unwrap_or_default()
                    .trim_end_matches('/'),
                self.root
                    .as_deref()
                    .map(|r| format!("/{}", r.trim_start_matches('/')))
                    .unwrap_or_default()
            ),
            StorageType::Memory => "memory".to_string(),
        }
    }
}

/// 根据配置创建 opendal Operator
pub fn build_operator(config: &StorageConfig) -> Result<Operator> {
    match config.typ {
        StorageType::Local => {
            use opendal::services::Fs;

            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            std::fs::create_dir_all(path)?;

            // 先写入临时目录再改名，覆盖时目标文件不会缺失
            let staging = std::path::Path::new(path).join(".sharesync-tmp");
            std::fs::create_dir_all(&staging)?;

            tracing::info!("初始化本地存储: {}", path);
            let builder = Fs::default()
                .root(path)
                .atomic_write_dir(&staging.to_string_lossy());
            Ok(Operator::new(builder)?.finish())
        }
        StorageType::S3 => {
            use opendal::services::S3;

            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;

            let mut builder = S3::default()
                .bucket(bucket)
                .region(region)
                .access_key_id(access_key)
                .secret_access_key(secret_key);
            if let Some(ep) = &config.endpoint {
                builder = builder.endpoint(ep);
            }
            if let Some(p) = &config.prefix {
                builder = builder.root(p);
            }

            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(with_timeouts(Operator::new(builder)?.finish()))
        }
        StorageType::WebDav => {
            use opendal::services::Webdav;

            let endpoint = config
                .webdav_endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;

            let mut builder = Webdav::default()
                .endpoint(endpoint)
                .username(username)
                .password(password);
            if let Some(r) = &config.root {
                builder = builder.root(r);
            }

            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(with_timeouts(Operator::new(builder)?.finish()))
        }
        StorageType::Memory => {
            use opendal::services::Memory;
            Ok(Operator::new(Memory::default())?.finish())
        }
    }
}

fn with_timeouts(operator: Operator) -> Operator {
    operator.layer(
        TimeoutLayer::default()
            .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
    )
}

/// 获取列表时的错误分类
pub(crate) fn to_remote_error(err: opendal::Error) -> RemoteError {
    match err.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(err.to_string()),
        ErrorKind::PermissionDenied | ErrorKind::ConfigInvalid => RemoteError::Auth(err.to_string()),
        _ => RemoteError::Unavailable(err.to_string()),
    }
}

/// 转存时的错误分类
pub(crate) fn to_transfer_error(err: opendal::Error) -> TransferError {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::NotFound => TransferError::permanent(PermanentKind::NotFound, message),
        ErrorKind::PermissionDenied => TransferError::permanent(PermanentKind::Denied, message),
        ErrorKind::AlreadyExists => TransferError::permanent(PermanentKind::AlreadyExists, message),
        ErrorKind::IsADirectory | ErrorKind::NotADirectory => {
            TransferError::permanent(PermanentKind::InvalidPath, message)
        }
        ErrorKind::RateLimited => TransferError::transient(TransientKind::RateLimited, message),
        _ if err.is_temporary() => TransferError::transient(TransientKind::Network, message),
        ErrorKind::Unexpected => TransferError::transient(TransientKind::Server, message),
        _ => TransferError::permanent(PermanentKind::Other, message),
    }
}
