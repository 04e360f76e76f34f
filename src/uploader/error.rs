// 上传错误定义

use crate::remote::{MergeRequest, RemoteError};
use crate::uploader::session::UploadPhase;
use crate::uploader::transport::TransportError;
use thiserror::Error;

/// 上传失败原因
///
/// 每次上传尝试只返回一个最终结果，调用方通过 `phase()` 得知失败阶段，
/// 通过 `is_retriable()` 区分网络波动和服务器拒绝
#[derive(Debug, Error)]
pub enum UploadError {
    /// 本地文件读取失败
    #[error("{phase}阶段读取文件失败: {source}")]
    Io {
        phase: UploadPhase,
        #[source]
        source: std::io::Error,
    },

    /// 空文件无法分片上传
    #[error("文件为空，无法上传")]
    EmptyFile,

    /// 文件状态检查失败
    #[error("检查文件状态失败: {0}")]
    CheckExistence(#[source] RemoteError),

    /// 分片上传失败（不可重试或重试次数用尽）
    #[error("分片 #{index} 上传失败（共尝试 {attempts} 次）: {source}")]
    Transfer {
        index: usize,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// 合并失败，可用 `request` 单独重新合并
    #[error("合并分片失败: {source}")]
    Merge {
        #[source]
        source: RemoteError,
        request: MergeRequest,
    },

    /// 分片任务异常退出
    #[error("分片任务异常: {0}")]
    Worker(String),

    /// 上传参数无效
    #[error("上传参数无效: {0}")]
    InvalidConfig(String),
}

impl UploadError {
    /// 由分片传输错误转换
    pub(crate) fn from_transport(index: usize, attempts: u32, error: TransportError) -> Self {
        match error {
            TransportError::Io(source) => UploadError::Io {
                phase: UploadPhase::Transferring,
                source,
            },
            TransportError::Remote(source) => UploadError::Transfer {
                index,
                attempts,
                source,
            },
        }
    }

    /// 失败阶段
    pub fn phase(&self) -> UploadPhase {
        match self {
            UploadError::Io { phase, .. } => *phase,
            UploadError::EmptyFile | UploadError::InvalidConfig(_) => UploadPhase::Preparing,
            UploadError::CheckExistence(_) => UploadPhase::CheckingExistence,
            UploadError::Transfer { .. } | UploadError::Worker(_) => UploadPhase::Transferring,
            UploadError::Merge { .. } => UploadPhase::Merging,
        }
    }

    /// 远程服务错误
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            UploadError::CheckExistence(e) => Some(e),
            UploadError::Transfer { source, .. } | UploadError::Merge { source, .. } => Some(source),
            _ => None,
        }
    }

    /// 是否为网络类的临时错误（稍后重新上传可能成功）
    pub fn is_retriable(&self) -> bool {
        self.remote_error().map(|e| e.is_retriable()).unwrap_or(false)
    }

    /// 是否为服务器明确拒绝
    pub fn is_rejection(&self) -> bool {
        self.remote_error().map(|e| !e.is_retriable()).unwrap_or(false)
    }

    /// 合并失败时的合并请求
    pub fn merge_request(&self) -> Option<&MergeRequest> {
        match self {
            UploadError::Merge { request, .. } => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::UploadErrorKind;

    #[test]
    fn test_phase_and_classification() {
        let err = UploadError::Transfer {
            index: 3,
            attempts: 4,
            source: RemoteError::new(UploadErrorKind::Network, "connection reset"),
        };
        assert_eq!(err.phase(), UploadPhase::Transferring);
        assert!(err.is_retriable());
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("#3"));

        let request = MergeRequest {
            file_name: "demo.mp4".to_string(),
            file_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            file_size: 1,
            chunks_total: 1,
        };
        let err = UploadError::Merge {
            source: RemoteError::from_status(400, "分片不完整"),
            request: request.clone(),
        };
        assert_eq!(err.phase(), UploadPhase::Merging);
        assert!(err.is_rejection());
        assert_eq!(err.merge_request(), Some(&request));

        assert_eq!(UploadError::EmptyFile.phase(), UploadPhase::Preparing);
        assert!(!UploadError::EmptyFile.is_retriable());
        assert!(!UploadError::EmptyFile.is_rejection());
    }

    #[test]
    fn test_from_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = UploadError::from_transport(1, 1, TransportError::Io(io));
        assert!(matches!(
            err,
            UploadError::Io {
                phase: UploadPhase::Transferring,
                ..
            }
        ));
    }
}
