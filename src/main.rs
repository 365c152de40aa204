use clap::{Parser, Subcommand};
use sharesync_lib::core::{DuplicatePolicy, ShareConfig};
use sharesync_lib::logging::{log_dir, LogConfig, SizeRotatingWriter};
use sharesync_lib::{AppState, StateStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "sharesync", version, about = "Mirror changed files from published shares")]
struct Cli {
    /// 配置目录（包含 config.json）
    #[arg(short, long, env = "SHARESYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 立即同步一次，然后按配置的间隔持续运行
    Run,
    /// 只同步一次
    Once,
    /// 添加监控分享
    Add {
        /// 分享链接，可以带 `?pwd=` 提取码
        url: String,
        /// 转存到的目标文件夹
        #[arg(long)]
        target: String,
        /// 提取码，优先于链接中的提取码
        #[arg(long)]
        password: Option<String>,
        /// 不保留目录结构，全部放在目标文件夹下
        #[arg(long)]
        flat: bool,
        /// 重名处理方式：overwrite 或 keep-both
        #[arg(long, default_value_t = DuplicatePolicy::Overwrite)]
        duplicate: DuplicatePolicy,
    },
    /// 移除监控分享并清除它的同步状态
    Remove { url: String },
    /// 查看同步历史
    History {
        /// 只显示该分享链接的历史
        #[arg(long)]
        share: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

/// 初始化日志系统
fn init_logging(data_dir: &Path, config: &LogConfig) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = config.env_filter();

    match SizeRotatingWriter::new(&log_dir(data_dir), config) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);

                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);

                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            // 在 release 模式下只输出到文件
            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let console_layer = tracing_subscriber::fmt::layer().with_target(false);
            let subscriber = tracing_subscriber::registry().with(env_filter).with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            tracing::warn!("无法创建日志文件，只输出到控制台: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut state = AppState::new(cli.config).await?;
    init_logging(&state.data_dir, &state.config.log);

    let result = match cli.command {
        Command::Run => run_loop(&mut state).await,
        Command::Once => run_once(&state).await,
        Command::Add {
            url,
            target,
            password,
            flat,
            duplicate,
        } => {
            let mut share = ShareConfig::new(url, target);
            share.password = password.filter(|p| !p.is_empty());
            share.preserve_path = !flat;
            share.duplicate = duplicate;
            add_share(&mut state, share)
        }
        Command::Remove { url } => remove_share(&mut state, &url).await,
        Command::History { share, limit } => show_history(&state, share.as_deref(), limit).await,
    };

    state.cleanup().await;
    result
}

async fn run_once(state: &AppState) -> anyhow::Result<()> {
    let coordinator = state.coordinator()?;
    let outcomes = coordinator.run_all(&state.config.monitored_shares).await;

    for (share, outcome) in &outcomes {
        println!("{} {}", share.url, outcome.record);
        for path in &outcome.record.failed_paths {
            println!("    失败: {}", path);
        }
    }
    Ok(())
}

async fn run_loop(state: &mut AppState) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到退出信号，等待当前同步结束...");
            cancel.cancel();
        }
    });

    let mut current_interval = state.config.scheduler.interval();
    let mut ticker = build_ticker(current_interval, Instant::now());
    tracing::info!(
        "开始监控 {} 个分享，每 {} 分钟检查一次",
        state.config.enabled_shares().count(),
        state.config.scheduler.interval_minutes
    );

    loop {
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // 每轮重新读取分享列表，配置错误时沿用上一次的配置
        if let Err(e) = state.reload_config() {
            tracing::error!("重新加载配置失败，沿用上次配置: {:#}", e);
        }

        if refresh_ticker(&mut ticker, &mut current_interval, state.config.scheduler.interval()) {
            tracing::info!("检查间隔已更新为 {} 分钟", state.config.scheduler.interval_minutes);
        }

        match state.coordinator() {
            Ok(coordinator) => {
                coordinator.run_all(&state.config.monitored_shares).await;
            }
            Err(e) => tracing::error!("无法开始同步: {:#}", e),
        }
    }

    tracing::info!("已停止监控");
    Ok(())
}

/// 从 `start` 开始按固定间隔触发，错过的轮次直接跳过
fn build_ticker(period: Duration, start: Instant) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// 间隔变化时重建定时器，下一轮在一个新间隔之后触发
fn refresh_ticker(ticker: &mut Interval, current: &mut Duration, period: Duration) -> bool {
    if period == *current {
        return false;
    }
    *current = period;
    *ticker = build_ticker(period, Instant::now() + period);
    true
}

fn add_share(state: &mut AppState, share: ShareConfig) -> anyhow::Result<()> {
    let url = share.url.clone();
    if state.add_share(share)? {
        println!("已添加: {}", url);
    } else {
        println!("分享链接已存在: {}", url);
    }
    Ok(())
}

async fn remove_share(state: &mut AppState, url: &str) -> anyhow::Result<()> {
    match state.remove_share(url).await? {
        Some(_) => println!("已移除: {}", url),
        None => println!("未找到分享链接: {}", url),
    }
    Ok(())
}

async fn show_history(state: &AppState, share_url: Option<&str>, limit: u32) -> anyhow::Result<()> {
    let shares: Vec<ShareConfig> = match share_url {
        Some(url) => vec![state
            .config
            .monitored_shares
            .iter()
            .find(|s| s.url == url)
            .cloned()
            .unwrap_or_else(|| ShareConfig::new(url, "-"))],
        None => state.config.monitored_shares.clone(),
    };

    for share in shares {
        let resolved = match share.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                println!("{}: {}", share.url, e);
                continue;
            }
        };

        println!("== {} ({})", share.url, resolved.id);
        let history = state.store.recent_history(&resolved.id, limit).await?;
        if history.is_empty() {
            println!("    暂无记录");
        }
        for record in history {
            println!("    {} {}", record.timestamp.format("%Y-%m-%d %H:%M:%S"), record);
        }
    }
    Ok(())
}
