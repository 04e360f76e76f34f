use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use video_uploader::{
    config::AppConfig,
    logging,
    remote::HttpUploadClient,
    uploader::{
        ChunkPlan, FileHandle, FingerprintCalculator, UploadCoordinator, UploadError, UploadEvent,
        UploadResult,
    },
};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 合并失败（可重试）时的自动重试次数
const MERGE_RETRY_TIMES: u32 = 2;

/// 合并重试间隔
const MERGE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "video-uploader")]
#[command(author, version, about = "可续传的视频分片上传工具", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传文件（支持秒传和断点续传）
    Upload {
        /// 本地文件路径
        file: PathBuf,

        /// 服务根地址，覆盖配置文件
        #[arg(short, long)]
        server: Option<String>,

        /// Bearer 令牌
        #[arg(long, env = "VIDEO_UPLOADER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// 分片大小 (MB)，覆盖配置文件
        #[arg(long)]
        chunk_size_mb: Option<u64>,

        /// 最大并发分片数，覆盖配置文件
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// 以 JSON 行输出上传事件
        #[arg(long)]
        json: bool,
    },

    /// 计算文件指纹（MD5）
    Fingerprint {
        /// 本地文件路径
        file: PathBuf,
    },

    /// 显示分片规划
    Plan {
        /// 本地文件路径
        file: PathBuf,

        /// 分片大小 (MB)
        #[arg(long)]
        chunk_size_mb: Option<u64>,
    },

    /// 写出默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 先加载配置再初始化日志，加载错误在日志就绪后输出
    let (mut config, load_error) = match AppConfig::load_from_file(&cli.config).await {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    let _log_guard = logging::init_logging(&config.log);

    match load_error {
        None => info!("配置文件加载成功: {}", cli.config),
        Some(e) => warn!("配置文件加载失败，使用默认配置: {:#}", e),
    }

    match cli.command {
        Command::Upload {
            file,
            server,
            token,
            chunk_size_mb,
            concurrency,
            json,
        } => {
            if let Some(server) = server {
                config.remote.base_url = server;
            }
            if token.is_some() {
                config.remote.token = token;
            }
            if let Some(mb) = chunk_size_mb {
                config.upload.chunk_size_mb = mb;
            }
            if let Some(n) = concurrency {
                config.upload.max_concurrent_chunks = n;
            }
            upload(&config, file, json).await
        }
        Command::Fingerprint { file } => fingerprint(&config, file).await,
        Command::Plan {
            file,
            chunk_size_mb,
        } => plan(chunk_size_mb.unwrap_or(config.upload.chunk_size_mb), file).await,
        Command::InitConfig { path } => {
            AppConfig::default().save_to_file(&path).await?;
            println!("已写出默认配置: {}", path);
            Ok(())
        }
    }
}

async fn upload(config: &AppConfig, path: PathBuf, json: bool) -> Result<()> {
    let file = FileHandle::open(&path)
        .await
        .with_context(|| format!("无法打开文件: {:?}", path))?;

    let options = config.upload.to_options()?;
    let client = HttpUploadClient::from_config(&config.remote)?;
    let coordinator = Arc::new(
        UploadCoordinator::new(Arc::new(client), options).context("上传参数无效")?,
    );

    let mut attempt = coordinator.spawn_upload(file);
    while let Some(event) = attempt.events.recv().await {
        print_event(&event, json)?;
    }

    let result = match attempt.join().await {
        Ok(result) => result,
        Err(e) => recover_merge(&coordinator, e).await?,
    };

    let (label, artifact) = match &result {
        UploadResult::Existing(a) => ("秒传成功", a),
        UploadResult::Merged(a) => ("上传完成", a),
    };
    println!("{}", label);
    println!(
        "{}",
        serde_json::to_string_pretty(artifact).context("序列化视频记录失败")?
    );
    Ok(())
}

/// 合并阶段的临时错误单独重试合并，分片不会重新上传
async fn recover_merge(coordinator: &UploadCoordinator, error: UploadError) -> Result<UploadResult> {
    let request = match error.merge_request() {
        Some(request) if error.is_retriable() => request.clone(),
        _ => return Err(error.into()),
    };

    let mut last_error = error;
    for retry in 1..=MERGE_RETRY_TIMES {
        warn!(
            "合并失败，{}s 后重试 ({}/{}): {}",
            MERGE_RETRY_DELAY.as_secs(),
            retry,
            MERGE_RETRY_TIMES,
            last_error
        );
        tokio::time::sleep(MERGE_RETRY_DELAY).await;

        match coordinator.retry_merge(&request).await {
            Ok(artifact) => return Ok(UploadResult::Merged(artifact)),
            Err(e) if e.is_retriable() => last_error = e,
            Err(e) => return Err(e.into()),
        }
    }

    Err(last_error.into())
}

fn print_event(event: &UploadEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        UploadEvent::StatusChanged { new_status, .. } => println!("[状态] {:?}", new_status),
        UploadEvent::Progress {
            progress,
            completed_chunks,
            total_chunks,
            message,
        } => println!(
            "[进度] {:>5.1}% ({}/{}) {}",
            progress, completed_chunks, total_chunks, message
        ),
        UploadEvent::ChunkCompleted {
            chunk_index,
            completed_chunks,
            total_chunks,
        } => println!(
            "[分片] #{} 完成 ({}/{})",
            chunk_index, completed_chunks, total_chunks
        ),
        UploadEvent::ChunkRetry {
            chunk_index,
            attempt,
            delay_ms,
            error,
        } => println!(
            "[重试] #{} 第 {} 次失败，{}ms 后重试: {}",
            chunk_index, attempt, delay_ms, error
        ),
    }
    Ok(())
}

async fn fingerprint(config: &AppConfig, path: PathBuf) -> Result<()> {
    let file = FileHandle::open(&path)
        .await
        .with_context(|| format!("无法打开文件: {:?}", path))?;

    let calculator =
        FingerprintCalculator::new((config.upload.fingerprint_window_mb * 1024 * 1024) as usize);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let fingerprint = calculator
        .compute(&file, tx)
        .await
        .with_context(|| format!("计算指纹失败: {:?}", path))?;
    let _ = drain.await;

    println!("{}  {}", fingerprint, file.name);
    Ok(())
}

async fn plan(chunk_size_mb: u64, path: PathBuf) -> Result<()> {
    let file = FileHandle::open(&path)
        .await
        .with_context(|| format!("无法打开文件: {:?}", path))?;

    let chunk_size = chunk_size_mb
        .checked_mul(1024 * 1024)
        .and_then(NonZeroU64::new)
        .context("分片大小必须大于 0")?;
    let plan = ChunkPlan::new(file.size, chunk_size);

    println!(
        "{}: {} bytes, 分片大小 {} bytes, 共 {} 个分片",
        file.name,
        plan.file_size(),
        plan.chunk_size(),
        plan.total_chunks()
    );
    for chunk in plan.chunks() {
        println!(
            "  #{:<4} {:>12} - {:<12} {} bytes",
            chunk.index,
            chunk.start,
            chunk.end,
            chunk.size
        );
    }
    Ok(())
}
