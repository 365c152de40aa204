//! 应用配置模块
//!
//! 配置保存在数据目录的 `config.json` 中，每个部分单独读取，缺失的部分使用默认值。

use crate::core::coordinator::CoordinatorSettings;
use crate::core::executor::ConcurrencyStrategy;
use crate::core::retry::{Backoff, RetryPolicy};
use crate::core::share::ShareConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::storage::StorageConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 重试等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// 同步配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 单个文件的最大重试次数
    #[serde(default = "default_max_retries", alias = "max_retries")]
    pub max_retries: u32,
    /// 0 顺序执行，-1 不限制，正数为并发数
    #[serde(default = "default_thread_pool_size", alias = "thread_pool_size")]
    pub thread_pool_size: i64,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 指数退避的最大延迟（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub retry_backoff: BackoffKind,
}

fn default_max_retries() -> u32 {
    3
}

fn default_thread_pool_size() -> i64 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            thread_pool_size: default_thread_pool_size(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_backoff: BackoffKind::default(),
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        let backoff = match self.retry_backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
            },
        };
        RetryPolicy::new(self.max_retries, backoff)
    }

    pub fn concurrency(&self) -> ConcurrencyStrategy {
        ConcurrencyStrategy::from_pool_size(self.thread_pool_size)
    }
}

/// 调度配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    /// 检查间隔（分钟）
    #[serde(default = "default_interval_minutes", alias = "interval_minutes")]
    pub interval_minutes: u64,
    /// 每个分享保留的历史记录条数
    #[serde(default = "default_max_history", alias = "max_history")]
    pub max_history: u32,
    /// 同时同步的分享数量
    #[serde(default = "default_max_parallel_shares")]
    pub max_parallel_shares: usize,
    /// 两次获取分享列表之间的最小间隔（毫秒）
    #[serde(default = "default_courtesy_delay_ms")]
    pub courtesy_delay_ms: u64,
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_max_history() -> u32 {
    1000
}

fn default_max_parallel_shares() -> usize {
    1
}

fn default_courtesy_delay_ms() -> u64 {
    1000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            max_history: default_max_history(),
            max_parallel_shares: default_max_parallel_shares(),
            courtesy_delay_ms: default_courtesy_delay_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_history: self.max_history,
            max_parallel_shares: self.max_parallel_shares.max(1),
            courtesy_delay: Duration::from_millis(self.courtesy_delay_ms),
        }
    }
}

/// 完整的应用配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub log: LogConfig,
    /// 分享来源（发布目录）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StorageConfig>,
    /// 转存目标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<StorageConfig>,
    #[serde(default, alias = "monitored_shares")]
    pub monitored_shares: Vec<ShareConfig>,
    /// 自定义数据目录（数据库和日志）
    #[serde(default, rename = "data_path", skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
}

impl AppConfig {
    /// 从配置目录加载，文件不存在时使用默认配置
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        if !config_file.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_file)?;
        let root: serde_json::Value = serde_json::from_str(&content)?;
        let shares_key = if root.get("monitoredShares").is_some() {
            "monitoredShares"
        } else {
            "monitored_shares"
        };

        let config = Self {
            sync: section(&root, "sync")?,
            scheduler: section(&root, "scheduler")?,
            log: section(&root, "log")?,
            source: section(&root, "source")?,
            destination: section(&root, "destination")?,
            monitored_shares: section(&root, shares_key)?,
            data_path: section(&root, "data_path")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 保存配置，保留文件中其他未知字段
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE_NAME);

        // 读取现有配置
        let mut root: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        let updated = serde_json::to_value(self)?;
        if let (Some(existing), serde_json::Value::Object(updated)) = (root.as_object_mut(), updated) {
            for (key, value) in updated {
                existing.insert(key, value);
            }
        }

        fs::write(&config_file, serde_json::to_string_pretty(&root)?)?;
        Ok(())
    }

    /// 只检查会导致运行失败的配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, share) in self.monitored_shares.iter().enumerate() {
            if share.target_folder_id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: format!("monitoredShares[{}].targetFolderId", i),
                    reason: "不能为空".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn enabled_shares(&self) -> impl Iterator<Item = &ShareConfig> {
        self.monitored_shares.iter().filter(|s| s.enabled)
    }
}

/// 读取配置中的一个部分，缺失时使用默认值
fn section<T: DeserializeOwned + Default>(root: &serde_json::Value, key: &str) -> Result<T, ConfigError> {
    match root.get(key) {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone()).map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        _ => Ok(T::default()),
    }
}
