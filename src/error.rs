//! 错误类型定义
//!
//! 单个文件的传输错误只会被记录到 `SyncResult` 中，不会向上传播；
//! 分享级别的错误（获取列表、读写状态库）记录在该分享的历史记录里。

use std::fmt;
use thiserror::Error;

/// 获取分享文件列表时的错误
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 网络、超时、限流等，本轮跳过该分享，下轮再试
    #[error("远程服务暂不可用: {0}")]
    Unavailable(String),
    /// 提取码错误或凭证失效，需要修改配置
    #[error("认证失败: {0}")]
    Auth(String),
    #[error("分享不存在: {0}")]
    NotFound(String),
    #[error("无效的分享链接: {0}")]
    InvalidShare(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// 可重试的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Network,
    Timeout,
    RateLimited,
    Server,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Network => write!(f, "network"),
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::RateLimited => write!(f, "rate_limited"),
            TransientKind::Server => write!(f, "server"),
        }
    }
}

/// 不可重试的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// 目标文件夹不存在
    DestinationMissing,
    InvalidPath,
    /// 目标已存在同名文件且不允许覆盖
    AlreadyExists,
    /// 源文件已不存在
    NotFound,
    Denied,
    Other,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermanentKind::DestinationMissing => write!(f, "destination_missing"),
            PermanentKind::InvalidPath => write!(f, "invalid_path"),
            PermanentKind::AlreadyExists => write!(f, "already_exists"),
            PermanentKind::NotFound => write!(f, "not_found"),
            PermanentKind::Denied => write!(f, "denied"),
            PermanentKind::Other => write!(f, "other"),
        }
    }
}

/// 单个文件转存的错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("临时错误 ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },
    #[error("永久错误 ({kind}): {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl TransferError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        TransferError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        TransferError::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            TransferError::Permanent {
                kind: PermanentKind::AlreadyExists,
                ..
            }
        )
    }
}

/// 状态库错误，出现时本轮不会写入任何快照
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库迁移失败: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("快照版本冲突: share={share_id}, 期望版本={expected}")]
    VersionConflict { share_id: String, expected: u64 },
    #[error("数据格式错误: {0}")]
    Corrupt(String),
}

/// 配置文件错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("无效的配置项 {key}: {reason}")]
    Invalid { key: String, reason: String },
}
