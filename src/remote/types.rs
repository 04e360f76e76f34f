// 上传服务接口数据类型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// 最终存储对象（服务器返回的视频记录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// 视频ID
    #[serde(default)]
    pub id: Option<i64>,

    /// 标题（服务器默认取去掉扩展名的文件名）
    #[serde(default)]
    pub title: Option<String>,

    /// 其余字段原样保留
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// 文件状态检查请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// 文件名
    pub file_name: String,
    /// 文件指纹（MD5）
    pub file_md5: String,
    /// 文件大小
    pub file_size: u64,
}

/// 文件状态检查响应
#[derive(Debug, Deserialize)]
pub struct CheckFileResponse {
    /// 是否已存在同指纹的视频
    #[serde(default)]
    pub exists: bool,

    /// 已存在的视频记录
    #[serde(default)]
    pub video: Option<Artifact>,

    /// 服务器已保存的分片索引
    #[serde(default)]
    pub uploaded_chunks: Vec<usize>,
}

impl CheckFileResponse {
    /// 转换为检查结果
    ///
    /// 只有 exists=true 且带回视频记录时才视为已存在，
    /// 否则按已上传分片继续上传
    pub fn into_existence(self) -> ExistenceCheck {
        match (self.exists, self.video) {
            (true, Some(artifact)) => ExistenceCheck::Exists(artifact),
            _ => ExistenceCheck::Partial {
                uploaded_chunks: self.uploaded_chunks,
            },
        }
    }
}

/// 文件状态检查结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExistenceCheck {
    /// 文件已完整存在，直接返回
    Exists(Artifact),
    /// 文件不存在，服务器已持有部分分片（可能为空）
    Partial { uploaded_chunks: Vec<usize> },
}

/// 分片上传请求
#[derive(Debug, Clone)]
pub struct ChunkUploadRequest {
    /// 文件名
    pub file_name: String,
    /// 文件指纹（MD5）
    pub file_md5: String,
    /// 分片索引（从 0 开始）
    pub chunk_index: usize,
    /// 总分片数
    pub chunks_total: usize,
    /// 分片数据
    pub data: Vec<u8>,
}

/// 分片上传响应
#[derive(Debug, Deserialize)]
pub struct ChunkUploadResponse {
    /// 提示信息
    #[serde(default)]
    pub detail: String,

    /// 服务器确认的分片索引
    #[serde(default)]
    pub chunk_index: Option<usize>,
}

/// 合并分片请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// 文件名
    pub file_name: String,
    /// 文件指纹（MD5）
    pub file_md5: String,
    /// 文件大小
    pub file_size: u64,
    /// 总分片数
    pub chunks_total: usize,
}

/// 合并分片响应
#[derive(Debug, Deserialize)]
pub struct MergeResponse {
    /// 提示信息
    #[serde(default)]
    pub detail: String,

    /// 合并后创建的视频记录
    #[serde(default)]
    pub video: Option<Artifact>,
}

/// 错误响应体
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
}

/// 上传错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 资源不存在（不可重试）
    FileNotFound,
    /// 未认证或权限不足（不可重试）
    Forbidden,
    /// 参数错误、大小或指纹不匹配（不可重试）
    BadRequest,
    /// 空间或大小超限（不可重试）
    QuotaExceeded,
    /// 未知错误（包括无法解析的响应）
    Unknown,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network
                | UploadErrorKind::Timeout
                | UploadErrorKind::ServerError
                | UploadErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            413 | 507 => UploadErrorKind::QuotaExceeded,
            500..=599 => UploadErrorKind::ServerError,
            401 | 403 => UploadErrorKind::Forbidden,
            404 | 410 => UploadErrorKind::FileNotFound,
            400 | 409 | 411 | 415 | 422 => UploadErrorKind::BadRequest,
            _ => UploadErrorKind::Unknown,
        }
    }
}

/// 远程服务错误
///
/// 网络类错误可重试，服务器明确拒绝的请求不可重试，
/// 调用方通过 `is_retriable()` 区分两者
#[derive(Debug, Clone, Error)]
#[error("{message} (kind={kind:?}, status={status:?})")]
pub struct RemoteError {
    /// 错误分类
    pub kind: UploadErrorKind,
    /// HTTP 状态码（未收到响应时为 None）
    pub status: Option<u16>,
    /// 错误信息
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// 根据 HTTP 状态码构造
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    /// 响应格式无法识别
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Unknown, message)
    }

    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}
