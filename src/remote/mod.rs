// 上传服务模块
//
// 服务器以文件指纹为键完成三件事：
// - 去重与续传查询（check）
// - 分片暂存（chunk），同一 (指纹, 索引) 只保存一份
// - 按索引顺序合并分片并创建视频记录（merge）

pub mod client;
pub mod types;

pub use client::{HttpUploadClient, UploadEndpoints};
pub use types::*;

use crate::uploader::ChunkProgress;
use async_trait::async_trait;

/// 远程上传服务
#[async_trait]
pub trait UploadRemote: Send + Sync {
    /// 检查文件是否已存在，或获取服务器已保存的分片索引
    async fn check_existence(&self, request: &CheckRequest) -> Result<ExistenceCheck, RemoteError>;

    /// 上传单个分片
    ///
    /// 只发起一次请求，不做任何重试；发送过程中通过 `progress` 上报已发送字节数
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        progress: ChunkProgress,
    ) -> Result<(), RemoteError>;

    /// 合并分片，返回最终的视频记录
    async fn merge(&self, request: &MergeRequest) -> Result<Artifact, RemoteError>;
}
