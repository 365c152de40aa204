//! 日志模块 - 提供按大小轮转的文件日志

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "sharesync.log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件的最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 保留的历史日志文件数量
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    10
}

fn default_backup_count() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            backup_count: default_backup_count(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// `RUST_LOG` 优先，其次是配置的级别；第三方库只输出警告
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env().add_directive(self.tracing_level().into());
        for directive in ["sqlx=warn", "opendal=warn", "hyper=warn", "reqwest=warn"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }
}

struct RotatingState {
    writer: Option<BufWriter<File>>,
    /// 当前文件已写入的字节数
    written: u64,
}

/// 带大小限制的日志写入器，超过上限后轮转为 `sharesync.log.1` ... `sharesync.log.N`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    backup_count: u32,
    state: Arc<Mutex<RotatingState>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, config: &LogConfig) -> io::Result<Self> {
        Self::with_limit(log_dir, u64::from(config.max_size_mb) * 1024 * 1024, config.backup_count)
    }

    pub fn with_limit(log_dir: &Path, max_size: u64, backup_count: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE_NAME);

        // 启动时文件已超过上限则先轮转
        let existing = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        let written = if existing > max_size {
            rotate_files(&file_path, backup_count)?;
            0
        } else {
            existing
        };

        let writer = open_file(&file_path)?;
        Ok(Self {
            file_path,
            max_size,
            backup_count,
            state: Arc::new(Mutex::new(RotatingState {
                writer: Some(writer),
                written,
            })),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn open_file(file_path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(file_path)?;
    Ok(BufWriter::new(file))
}

/// `log.{n-1}` -> `log.{n}`，当前文件 -> `log.1`，超出数量的删除
fn rotate_files(file_path: &Path, backup_count: u32) -> io::Result<()> {
    let backup = |n: u32| PathBuf::from(format!("{}.{}", file_path.display(), n));

    if backup_count == 0 {
        return fs::remove_file(file_path);
    }

    let oldest = backup(backup_count);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backup_count).rev() {
        let from = backup(n);
        if from.exists() {
            fs::rename(&from, backup(n + 1))?;
        }
    }
    if file_path.exists() {
        fs::rename(file_path, backup(1))?;
    }
    Ok(())
}

/// 日志写入器包装
pub struct LogWriter {
    file_path: PathBuf,
    max_size: u64,
    backup_count: u32,
    state: Arc<Mutex<RotatingState>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;

        if state.written > 0 && state.written + buf.len() as u64 > self.max_size {
            if let Some(mut w) = state.writer.take() {
                let _ = w.flush();
            }
            rotate_files(&self.file_path, self.backup_count)?;
            state.writer = Some(open_file(&self.file_path)?);
            state.written = 0;
        }

        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("Writer not available"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        match state.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file_path: self.file_path.clone(),
            max_size: self.max_size,
            backup_count: self.backup_count,
            state: self.state.clone(),
        }
    }
}

/// 日志目录（跟随数据目录）
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}
