// 文件指纹计算
//
// 指纹是整个文件内容的 MD5（32 位小写十六进制）：
// 1. 服务器以指纹为键判断文件是否已存在（秒传）
// 2. 服务器以指纹为键保存已上传分片（断点续传）
//
// 指纹与分片大小、读取窗口大小无关，相同字节永远得到相同指纹

use crate::uploader::chunk::FileHandle;
use md5::Context as Md5Context;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// 默认读取窗口: 2MB
pub const DEFAULT_FINGERPRINT_WINDOW: usize = 2 * 1024 * 1024;

/// 文件指纹
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 解析指纹字符串（32 位十六进制，统一转为小写）
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 指纹计算器
///
/// 每次计算独占一个 MD5 上下文，失败后丢弃，重新计算从第 0 字节开始
#[derive(Debug, Clone)]
pub struct FingerprintCalculator {
    window_size: usize,
}

impl Default for FingerprintCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_FINGERPRINT_WINDOW)
    }
}

impl FingerprintCalculator {
    /// 创建计算器，窗口为 0 时使用默认值
    pub fn new(window_size: usize) -> Self {
        let window_size = if window_size == 0 {
            DEFAULT_FINGERPRINT_WINDOW
        } else {
            window_size
        };
        Self { window_size }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// 计算文件指纹
    ///
    /// 每读完一个窗口通过 `progress` 发送一次完成比例（0.0 ~ 1.0，单调不减），
    /// 结束时一定发送 1.0。接收端关闭不影响计算。
    pub async fn compute(
        &self,
        file: &FileHandle,
        progress: UnboundedSender<f64>,
    ) -> io::Result<Fingerprint> {
        let path = file.path.clone();
        let expected_size = file.size;
        let window_size = self.window_size;

        info!(
            "开始计算文件指纹: path={:?}, size={}, window={}",
            path, expected_size, window_size
        );

        // 在阻塞线程池中执行文件 I/O
        let fingerprint = tokio::task::spawn_blocking(move || {
            Self::compute_sync(&path, expected_size, window_size, &progress)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("计算指纹任务执行失败: {}", e)))??;

        info!("文件指纹计算完成: {}", fingerprint);
        Ok(fingerprint)
    }

    fn compute_sync(
        path: &Path,
        expected_size: u64,
        window_size: usize,
        progress: &UnboundedSender<f64>,
    ) -> io::Result<Fingerprint> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Md5Context::new();
        let mut buffer = vec![0u8; window_size];
        let mut processed = 0u64;

        loop {
            let bytes_read = read_window(&mut file, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            hasher.consume(&buffer[..bytes_read]);
            processed += bytes_read as u64;

            if processed > expected_size {
                break;
            }

            let fraction = if expected_size == 0 {
                1.0
            } else {
                processed as f64 / expected_size as f64
            };
            let _ = progress.send(fraction.min(1.0));
        }

        if processed != expected_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "文件在计算指纹期间被修改: 预期 {} bytes, 实际读取 {} bytes",
                    expected_size, processed
                ),
            ));
        }

        let _ = progress.send(1.0);

        let digest = format!("{:x}", hasher.compute());
        debug!("指纹计算: path={:?}, size={}, md5={}", path, processed, digest);

        Ok(Fingerprint(digest))
    }
}

/// 尽量填满一个窗口，返回实际读取的字节数（0 表示文件结束）
fn read_window(file: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
