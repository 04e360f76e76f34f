// 上传会话定义
//
// 会话在文件状态检查之后创建，只由协调器持有和修改，不做本地持久化；
// 中断后的恢复依赖服务器按指纹保存的分片

use crate::remote::{CheckRequest, MergeRequest};
use crate::uploader::fingerprint::Fingerprint;
use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 空闲
    Idle,
    /// 计算指纹中
    Fingerprinting,
    /// 检查文件状态中
    CheckingExistence,
    /// 服务器已有相同文件（秒传）
    ShortCircuitComplete,
    /// 根据服务器已有分片准备续传
    Resuming,
    /// 上传分片中
    Transferring,
    /// 合并分片中
    Merging,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::ShortCircuitComplete | UploadStatus::Completed | UploadStatus::Failed
        )
    }

    /// 是否允许转换到目标状态
    ///
    /// 任何非终态都可以转为 Failed
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Fingerprinting)
                | (Fingerprinting, CheckingExistence)
                | (CheckingExistence, ShortCircuitComplete)
                | (CheckingExistence, Resuming)
                | (Resuming, Transferring)
                | (Transferring, Merging)
                | (Merging, Completed)
        )
    }
}

/// 出错阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    /// 准备（打开文件、校验参数）
    Preparing,
    Fingerprinting,
    CheckingExistence,
    Transferring,
    Merging,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Preparing => "准备",
            UploadPhase::Fingerprinting => "计算指纹",
            UploadPhase::CheckingExistence => "检查文件",
            UploadPhase::Transferring => "上传分片",
            UploadPhase::Merging => "合并分片",
        };
        f.write_str(name)
    }
}

/// 会话不可变部分，只读共享给分片传输
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub fingerprint: Fingerprint,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
}

impl SessionKey {
    pub fn check_request(&self) -> CheckRequest {
        CheckRequest {
            file_name: self.file_name.clone(),
            file_md5: self.fingerprint.to_string(),
            file_size: self.file_size,
        }
    }

    pub fn merge_request(&self) -> MergeRequest {
        MergeRequest {
            file_name: self.file_name.clone(),
            file_md5: self.fingerprint.to_string(),
            file_size: self.file_size,
            chunks_total: self.total_chunks,
        }
    }
}

/// 上传会话
#[derive(Debug)]
pub struct UploadSession {
    /// 不可变部分
    pub key: Arc<SessionKey>,
    /// 服务器已持有的分片
    resume_set: BitSet,
    /// 本次尝试确认完成的分片
    completed: BitSet,
    /// 本次尝试已派发的分片
    dispatched: BitSet,
    /// 当前状态
    status: UploadStatus,
}

impl UploadSession {
    /// 创建会话
    ///
    /// 超出分片范围的续传索引会被忽略
    pub fn new(key: Arc<SessionKey>, uploaded_chunks: &[usize]) -> Self {
        let mut resume_set = BitSet::with_capacity(key.total_chunks);
        for &index in uploaded_chunks {
            if index < key.total_chunks {
                resume_set.insert(index);
            } else {
                warn!(
                    "忽略越界的已上传分片索引: index={}, total_chunks={}, md5={}",
                    index, key.total_chunks, key.fingerprint
                );
            }
        }

        Self {
            key,
            resume_set,
            completed: BitSet::new(),
            dispatched: BitSet::new(),
            status: UploadStatus::Resuming,
        }
    }

    pub fn resume_set(&self) -> &BitSet {
        &self.resume_set
    }

    pub fn completed(&self) -> &BitSet {
        &self.completed
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
    }

    /// 标记分片已派发
    ///
    /// 同一分片在一次尝试中只派发一次，服务器已持有的分片不派发
    pub fn mark_dispatched(&mut self, index: usize) -> bool {
        if index >= self.key.total_chunks || self.resume_set.contains(index) {
            return false;
        }
        self.dispatched.insert(index)
    }

    /// 标记分片完成，返回是否为新完成
    pub fn mark_completed(&mut self, index: usize) -> bool {
        if index >= self.key.total_chunks {
            return false;
        }
        self.completed.insert(index)
    }

    /// 已完成（服务器已有 + 本次完成）的分片数
    pub fn accounted_count(&self) -> usize {
        self.resume_set.union(&self.completed).count()
    }

    /// 所有分片都已在服务器上
    pub fn all_accounted(&self) -> bool {
        self.accounted_count() == self.key.total_chunks
    }
}
