// 配置管理模块

use crate::uploader::{
    BackoffPolicy, PhaseWeights, UploadOptions, DEFAULT_FINGERPRINT_WINDOW,
    DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_MAX_RETRIES, DEFAULT_PROGRESS_INTERVAL_MS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传服务配置
    #[serde(default)]
    pub remote: RemoteConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

// 命令行工具默认只输出到终端
fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// 服务根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 文件状态检查接口
    #[serde(default = "default_check_path")]
    pub check_path: String,
    /// 分片上传接口
    #[serde(default = "default_chunk_path")]
    pub chunk_path: String,
    /// 分片合并接口
    #[serde(default = "default_merge_path")]
    pub merge_path: String,
    /// 单个请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bearer 令牌（由外部获取）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_check_path() -> String {
    "/videos/upload/check/".to_string()
}

fn default_chunk_path() -> String {
    "/videos/upload/chunk/".to_string()
}

fn default_merge_path() -> String {
    "/videos/upload/merge/".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            check_path: default_check_path(),
            chunk_path: default_chunk_path(),
            merge_path: default_merge_path(),
            timeout_secs: default_timeout_secs(),
            token: None,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 分片大小 (MB)
    pub chunk_size_mb: u64,
    /// 最大并发分片数
    pub max_concurrent_chunks: usize,
    /// 单个分片最大重试次数（0 表示不重试）
    pub max_retries: u32,
    /// 指纹计算读取窗口 (MB)
    pub fingerprint_window_mb: u64,
    /// 分片内进度事件节流间隔（毫秒，0 表示不节流）
    pub progress_interval_ms: u64,
    /// 初始退避延迟（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    pub max_backoff_ms: u64,
    /// 限流时的最短等待（毫秒）
    pub rate_limit_backoff_ms: u64,
    /// 进度权重
    pub weights: PhaseWeights,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            chunk_size_mb: 2,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_retries: DEFAULT_MAX_RETRIES,
            fingerprint_window_mb: (DEFAULT_FINGERPRINT_WINDOW / 1024 / 1024) as u64,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            initial_backoff_ms: backoff.initial.as_millis() as u64,
            max_backoff_ms: backoff.max.as_millis() as u64,
            rate_limit_backoff_ms: backoff.rate_limited.as_millis() as u64,
            weights: PhaseWeights::default(),
        }
    }
}

impl UploadConfig {
    /// 验证上传配置
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size_mb == 0 {
            return Err("分片大小必须大于 0".to_string());
        }
        if self.chunk_size_mb > 1024 {
            return Err(format!("分片大小 {}MB 过大，最大 1024MB", self.chunk_size_mb));
        }
        if self.max_concurrent_chunks == 0 {
            return Err("最大并发分片数必须大于 0".to_string());
        }
        if self.max_concurrent_chunks > 32 {
            return Err(format!(
                "最大并发分片数 {} 超过上限 32，过高的并发可能触发服务器限流",
                self.max_concurrent_chunks
            ));
        }
        if self.fingerprint_window_mb == 0 {
            return Err("指纹读取窗口必须大于 0".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "初始退避延迟 {}ms 不能大于最大退避延迟 {}ms",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        self.weights.validate()
    }

    /// 转换为上传参数
    pub fn to_options(&self) -> Result<UploadOptions> {
        self.validate().map_err(|e| anyhow::anyhow!(e))?;

        let chunk_size = NonZeroU64::new(self.chunk_size_mb * 1024 * 1024)
            .context("分片大小必须大于 0")?;

        Ok(UploadOptions {
            chunk_size,
            max_concurrent_chunks: self.max_concurrent_chunks,
            max_retries: self.max_retries,
            fingerprint_window: (self.fingerprint_window_mb * 1024 * 1024) as usize,
            weights: self.weights,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(self.initial_backoff_ms),
                max: Duration::from_millis(self.max_backoff_ms),
                rate_limited: Duration::from_millis(self.rate_limit_backoff_ms),
            },
        })
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .map_err(|e| anyhow::anyhow!("配置文件中的上传配置无效: {}", e))?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .map_err(|e| anyhow::anyhow!("保存配置失败：{}", e))?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    ///
    /// 不会自动写出默认配置文件，需要时使用 `init-config` 子命令
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
