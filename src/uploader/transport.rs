// 分片传输
//
// 单个分片的一次网络传输：读取分片数据 → 调用一次上传接口 → 上报字节进度
// 不做重试，重试由协调器决定

use crate::remote::{ChunkUploadRequest, RemoteError, UploadRemote};
use crate::uploader::chunk::{read_chunk, ChunkDescriptor, FileHandle};
use crate::uploader::session::SessionKey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// 分片工作者发给协调器的信号
#[derive(Debug, Clone, PartialEq)]
pub enum TransferSignal {
    /// 已发送字节数
    Progress {
        index: usize,
        sent_bytes: u64,
        total_bytes: u64,
    },
    /// 即将重试
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

/// 单个分片的进度上报器
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    index: usize,
    total_bytes: u64,
    signals: UnboundedSender<TransferSignal>,
}

impl ChunkProgress {
    pub fn new(index: usize, total_bytes: u64, signals: UnboundedSender<TransferSignal>) -> Self {
        Self {
            index,
            total_bytes,
            signals,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 上报已发送字节数
    pub fn report(&self, sent_bytes: u64) {
        let _ = self.signals.send(TransferSignal::Progress {
            index: self.index,
            sent_bytes: sent_bytes.min(self.total_bytes),
            total_bytes: self.total_bytes,
        });
    }
}

/// 分片传输错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// 本地读取失败
    #[error("读取分片失败: {0}")]
    Io(#[from] std::io::Error),

    /// 服务器返回错误或网络失败
    #[error("上传分片失败: {0}")]
    Remote(#[from] RemoteError),
}

impl TransportError {
    /// 是否可重试（本地读取失败不重试）
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Io(_) => false,
            TransportError::Remote(e) => e.is_retriable(),
        }
    }
}

/// 分片传输
#[derive(Clone)]
pub struct ChunkTransport {
    remote: Arc<dyn UploadRemote>,
}

impl ChunkTransport {
    pub fn new(remote: Arc<dyn UploadRemote>) -> Self {
        Self { remote }
    }

    /// 发送一个分片
    pub async fn send_chunk(
        &self,
        file: &FileHandle,
        chunk: &ChunkDescriptor,
        key: &SessionKey,
        signals: UnboundedSender<TransferSignal>,
    ) -> Result<(), TransportError> {
        let data = read_chunk(file, chunk).await?;
        let progress = ChunkProgress::new(chunk.index, chunk.size, signals);
        progress.report(0);

        debug!(
            "[分片#{}] 开始发送: bytes={}-{}, md5={}",
            chunk.index,
            chunk.start,
            chunk.end.saturating_sub(1),
            key.fingerprint
        );

        let request = ChunkUploadRequest {
            file_name: key.file_name.clone(),
            file_md5: key.fingerprint.to_string(),
            chunk_index: chunk.index,
            chunks_total: key.total_chunks,
            data,
        };
        self.remote.upload_chunk(request, progress.clone()).await?;

        progress.report(chunk.size);
        Ok(())
    }
}
