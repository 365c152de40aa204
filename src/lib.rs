use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod remote;
pub mod storage;

pub use config::AppConfig;
pub use crate::core::{RunCoordinator, ShareConfig, SyncExecutor};
pub use db::{SqliteStateStore, StateStore};

/// 数据库文件名
pub const DB_FILE_NAME: &str = "sharesync.db";

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// `config.json` 所在目录
    pub config_dir: PathBuf,
    /// 数据库和日志所在目录
    pub data_dir: PathBuf,
    pub store: Arc<SqliteStateStore>,
    /// 关闭时取消正在进行的同步
    pub cancel: CancellationToken,
}

impl AppState {
    pub async fn new(config_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_dir = config_dir.unwrap_or_else(default_config_dir);
        std::fs::create_dir_all(&config_dir)?;

        let config = AppConfig::load(&config_dir)
            .with_context(|| format!("加载配置失败: {}", config_dir.display()))?;

        // 自定义数据路径不存在时回退到配置目录
        let data_dir = config
            .data_path
            .clone()
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or_else(|| config_dir.clone());

        let store = SqliteStateStore::connect(&data_dir.join(DB_FILE_NAME)).await?;

        Ok(Self {
            config,
            config_dir,
            data_dir,
            store: Arc::new(store),
            cancel: CancellationToken::new(),
        })
    }

    /// 重新读取配置文件，每轮同步前调用
    pub fn reload_config(&mut self) -> anyhow::Result<()> {
        self.config = AppConfig::load(&self.config_dir)?;
        Ok(())
    }

    /// 添加监控分享，链接已存在时不做修改并返回 false
    pub fn add_share(&mut self, share: ShareConfig) -> anyhow::Result<bool> {
        let resolved = share.resolve()?;
        if self.config.monitored_shares.iter().any(|s| s.url == share.url) {
            tracing::warn!("分享链接已存在: {}", share.url);
            return Ok(false);
        }

        let mut config = self.config.clone();
        config.monitored_shares.push(share);
        config.validate()?;
        config.save(&self.config_dir)?;
        self.config = config;

        tracing::info!("成功添加监控分享: {}", resolved.id);
        Ok(true)
    }

    /// 移除监控分享，同时清除它的快照和历史
    pub async fn remove_share(&mut self, url: &str) -> anyhow::Result<Option<ShareConfig>> {
        let Some(index) = self.config.monitored_shares.iter().position(|s| s.url == url) else {
            tracing::warn!("未找到分享链接: {}", url);
            return Ok(None);
        };

        let removed = self.config.monitored_shares.remove(index);
        self.config.save(&self.config_dir)?;

        match removed.resolve() {
            Ok(resolved) => self.store.forget_share(&resolved.id).await?,
            Err(e) => tracing::debug!("无效链接没有同步状态: {}", e),
        }

        tracing::info!("分享链接监控已移除: {}", url);
        Ok(Some(removed))
    }

    /// 根据当前配置组装协调器
    pub fn coordinator(&self) -> anyhow::Result<RunCoordinator> {
        let source = self
            .config
            .source
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("配置中缺少 source 存储"))?;
        let destination = self
            .config
            .destination
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("配置中缺少 destination 存储"))?;

        let lister = storage::StorageShareLister::from_config(source)?;
        let transfer = storage::StorageTransfer::from_config(source, destination)?;
        let executor = SyncExecutor::new(
            Arc::new(transfer),
            self.config.sync.concurrency(),
            self.config.sync.retry_policy(),
        );

        Ok(RunCoordinator::new(Arc::new(lister), self.store.clone(), executor)
            .with_settings(self.config.scheduler.coordinator_settings())
            .with_cancellation(self.cancel.clone()))
    }

    /// 清理资源（退出时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        self.cancel.cancel();

        tracing::debug!("关闭数据库连接池...");
        self.store.close().await;

        tracing::info!("资源清理完成");
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("sharesync"))
        .unwrap_or_else(|| PathBuf::from(".sharesync"))
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }
}
