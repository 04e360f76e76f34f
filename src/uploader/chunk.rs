// 上传分片规划
//
// 分片规则：
// - 分片数 = ceil(文件大小 / 分片大小)
// - 分片 i 覆盖 [i * 分片大小, min((i + 1) * 分片大小, 文件大小))
// - 只有最后一个分片可能小于分片大小
// - 同一 (文件大小, 分片大小) 的规划结果永远相同，服务器依赖它做续传

use bit_set::BitSet;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroU64;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 默认上传分片大小: 2MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 本地待上传文件
///
/// 只读引用，一次上传尝试期间由调用方持有
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// 本地路径
    pub path: PathBuf,
    /// 文件名（上传到服务器的名字）
    pub name: String,
    /// 文件大小
    pub size: u64,
}

impl FileHandle {
    /// 根据文件元数据创建
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是普通文件: {:?}", path),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("无法获取文件名: {:?}", path))
            })?;

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }
}

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 起始偏移（包含）
    pub start: u64,
    /// 结束偏移（不包含）
    pub end: u64,
    /// 分片大小
    pub size: u64,
    /// 总分片数
    pub total_chunks: usize,
}

impl ChunkDescriptor {
    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// 计算分片
///
/// 空文件返回空列表
pub fn plan_chunks(file_size: u64, chunk_size: NonZeroU64) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.get();
    let total_chunks = file_size.div_ceil(chunk_size) as usize;

    (0..total_chunks)
        .map(|index| {
            let start = index as u64 * chunk_size;
            let end = start.saturating_add(chunk_size).min(file_size);
            ChunkDescriptor {
                index,
                start,
                end,
                size: end - start,
                total_chunks,
            }
        })
        .collect()
}

/// 分片规划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: NonZeroU64) -> Self {
        let chunks = plan_chunks(file_size, chunk_size);

        info!(
            "创建分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_size,
            chunk_size,
            chunks.len()
        );

        Self {
            file_size,
            chunk_size: chunk_size.get(),
            chunks,
        }
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    /// 获取分片数量
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn get(&self, index: usize) -> Option<&ChunkDescriptor> {
        self.chunks.get(index)
    }

    /// 服务器尚未持有的分片，按索引升序
    pub fn pending(&self, resume_set: &BitSet) -> Vec<ChunkDescriptor> {
        self.chunks
            .iter()
            .filter(|c| !resume_set.contains(c.index))
            .copied()
            .collect()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// 读取分片数据
///
/// 在阻塞线程池中定位并读取，文件比规划时短会返回 UnexpectedEof
pub async fn read_chunk(file: &FileHandle, chunk: &ChunkDescriptor) -> io::Result<Vec<u8>> {
    let path = file.path.clone();
    let chunk = *chunk;

    let buffer = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(chunk.start))?;

        let mut buffer = vec![0u8; chunk.size as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("读取分片任务异常: {}", e)))??;

    debug!(
        "读取分片 #{}: bytes={}-{}, 大小={} bytes",
        chunk.index,
        chunk.start,
        chunk.end.saturating_sub(1),
        buffer.len()
    );

    Ok(buffer)
}
