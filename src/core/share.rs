//! 分享链接配置与解析

use crate::error::RemoteError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static SHARE_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://([^/]+)/s/([^?/#]+)").expect("valid share url regex"));
static SHARE_PWD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]pwd=([^&#]+)").expect("valid pwd regex"));

/// 文件重名处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "DuplicateRepr")]
pub enum DuplicatePolicy {
    /// 保留两者，新文件自动添加后缀
    KeepBoth,
    /// 直接覆盖
    #[default]
    Overwrite,
}

/// 兼容旧配置中的数字写法：1-保留两者，2-覆盖
#[derive(Deserialize)]
#[serde(untagged)]
enum DuplicateRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<DuplicateRepr> for DuplicatePolicy {
    type Error = String;

    fn try_from(value: DuplicateRepr) -> Result<Self, Self::Error> {
        match value {
            DuplicateRepr::Code(1) => Ok(DuplicatePolicy::KeepBoth),
            DuplicateRepr::Code(2) => Ok(DuplicatePolicy::Overwrite),
            DuplicateRepr::Name(name) => match name.as_str() {
                "keep-both" | "keep_both" => Ok(DuplicatePolicy::KeepBoth),
                "overwrite" => Ok(DuplicatePolicy::Overwrite),
                _ => Err(format!("无效的重名处理方式: {}", name)),
            },
            DuplicateRepr::Code(code) => Err(format!("无效的重名处理方式: {}", code)),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    /// 命令行参数接受名称或数字编码
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let repr = match s.trim().parse::<u8>() {
            Ok(code) => DuplicateRepr::Code(code),
            Err(_) => DuplicateRepr::Name(s.trim().to_lowercase()),
        };
        Self::try_from(repr)
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::KeepBoth => write!(f, "keep-both"),
            DuplicatePolicy::Overwrite => write!(f, "overwrite"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_preserve_path() -> bool {
    true
}

/// 单个监控分享的配置，一轮同步内不会被修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareConfig {
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 用户单独提供的提取码，优先级高于链接中的 pwd 参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(alias = "target_folder_id")]
    pub target_folder_id: String,
    #[serde(default = "default_preserve_path", alias = "preserve_path")]
    pub preserve_path: bool,
    #[serde(default)]
    pub duplicate: DuplicatePolicy,
}

impl ShareConfig {
    pub fn new(url: impl Into<String>, target_folder_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            password: None,
            target_folder_id: target_folder_id.into(),
            preserve_path: true,
            duplicate: DuplicatePolicy::default(),
        }
    }

    /// 解析链接并确定本轮使用的提取码和分享标识
    pub fn resolve(&self) -> Result<ResolvedShare, RemoteError> {
        let share_ref = ShareRef::parse(&self.url)?;
        let password = self
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| share_ref.link_password.clone());
        let id = ShareId::new(&share_ref.key, password.as_deref());

        Ok(ResolvedShare {
            config: self.clone(),
            share_ref,
            password,
            id,
        })
    }
}

/// 解析后的分享链接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRef {
    pub host: String,
    pub key: String,
    /// 链接中携带的提取码（已 URL 解码）
    pub link_password: Option<String>,
}

impl ShareRef {
    /// 解析 `https://<host>/s/<key>?pwd=<提取码>` 形式的链接
    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let caps = SHARE_URL_RE
            .captures(url.trim())
            .ok_or_else(|| RemoteError::InvalidShare(url.to_string()))?;

        let link_password = SHARE_PWD_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| {
                urlencoding::decode(m.as_str())
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| m.as_str().to_string())
            });

        Ok(Self {
            host: caps[1].to_string(),
            key: caps[2].to_string(),
            link_password,
        })
    }
}

/// 分享的唯一标识，同时也是状态库的主键
///
/// 提取码变化后视为新的分享，会重新进行一次完整同步。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    pub fn new(key: &str, password: Option<&str>) -> Self {
        Self(format!("{}_{}", key, password.unwrap_or("no_pwd")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ShareId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一轮同步中使用的分享上下文
#[derive(Debug, Clone)]
pub struct ResolvedShare {
    pub config: ShareConfig,
    pub share_ref: ShareRef,
    pub password: Option<String>,
    pub id: ShareId,
}
