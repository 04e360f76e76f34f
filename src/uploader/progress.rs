//! 上传进度聚合
//!
//! 把各阶段的进度信号折算成一个单调不减的总百分比，并按顺序发送事件：
//!
//! ```text
//! overall = 100 × (w_fp × 指纹进度 + w_xfer × (已完成分片 + 在传分片进度之和) / 总分片数 + w_merge × 合并进度)
//! ```
//!
//! 默认权重 0.2 / 0.7 / 0.1。合并成功或秒传之前进度不会达到 100。

use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use crate::uploader::session::UploadStatus;

/// 默认节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// 完成前允许上报的最大进度
const MAX_UNFINISHED_PROGRESS: f64 = 99.9;

/// 各阶段权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    /// 计算指纹
    pub fingerprint: f64,
    /// 上传分片
    pub transfer: f64,
    /// 合并分片
    pub merge: f64,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            fingerprint: 0.2,
            transfer: 0.7,
            merge: 0.1,
        }
    }
}

impl PhaseWeights {
    /// 校验权重：非负且总和为 1
    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.fingerprint, self.transfer, self.merge];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(format!("进度权重必须为非负数: {:?}", self));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("进度权重之和必须为 1.0，当前为 {}", sum));
        }
        Ok(())
    }
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 状态变更
    StatusChanged {
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 进度更新
    Progress {
        /// 总进度（0 ~ 100）
        progress: f64,
        completed_chunks: usize,
        total_chunks: usize,
        message: String,
    },
    /// 分片完成
    ChunkCompleted {
        chunk_index: usize,
        completed_chunks: usize,
        total_chunks: usize,
    },
    /// 分片重试
    ChunkRetry {
        chunk_index: usize,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

/// 进度事件节流器
///
/// 只在协调器任务内使用，不需要原子操作
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressThrottler {
    /// 创建节流器，间隔为 0 时不节流
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: None,
            interval,
        }
    }

    /// 距离上次发布已超过节流间隔时返回 true 并记录时间
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// 强制发布（阶段切换、分片完成）
    pub fn force_emit(&mut self) -> bool {
        self.last_emit = Some(Instant::now());
        true
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS))
    }
}

/// 进度聚合器
///
/// 由协调器独占，所有分片信号都经由协调器转交，不需要加锁
#[derive(Debug)]
pub struct ProgressAggregator {
    events: UnboundedSender<UploadEvent>,
    weights: PhaseWeights,
    throttler: ProgressThrottler,
    /// 指纹进度（0 ~ 1）
    fingerprint: f64,
    total_chunks: usize,
    /// 已完成分片数（服务器已有 + 本次完成）
    completed_chunks: usize,
    /// 本次完成的分片
    done: BitSet,
    /// 在传分片进度（0 ~ 1）
    in_flight: HashMap<usize, f64>,
    /// 合并进度（0 ~ 1）
    merge: f64,
    /// 已上报的最大进度
    reported: f64,
    finished: bool,
}

impl ProgressAggregator {
    pub fn new(events: UnboundedSender<UploadEvent>, weights: PhaseWeights, interval: Duration) -> Self {
        Self {
            events,
            weights,
            throttler: ProgressThrottler::new(interval),
            fingerprint: 0.0,
            total_chunks: 0,
            completed_chunks: 0,
            done: BitSet::new(),
            in_flight: HashMap::new(),
            merge: 0.0,
            reported: 0.0,
            finished: false,
        }
    }

    /// 按当前各阶段进度计算的总进度（未做单调处理）
    pub fn overall(&self) -> f64 {
        let transfer = if self.total_chunks == 0 {
            0.0
        } else {
            let current: f64 = self.in_flight.values().sum();
            ((self.completed_chunks as f64 + current) / self.total_chunks as f64).min(1.0)
        };

        let value = 100.0
            * (self.weights.fingerprint * self.fingerprint
                + self.weights.transfer * transfer
                + self.weights.merge * self.merge);
        value.clamp(0.0, 100.0)
    }

    /// 已上报的进度
    pub fn current(&self) -> f64 {
        self.reported
    }

    pub fn completed_chunks(&self) -> usize {
        self.completed_chunks
    }

    pub fn status_changed(&mut self, old_status: UploadStatus, new_status: UploadStatus) {
        self.send(UploadEvent::StatusChanged {
            old_status,
            new_status,
        });
    }

    pub fn fingerprint_progress(&mut self, fraction: f64) {
        self.fingerprint = self.fingerprint.max(fraction.clamp(0.0, 1.0));
        self.emit_progress("计算文件指纹", false);
    }

    pub fn fingerprint_done(&mut self) {
        self.fingerprint = 1.0;
        self.emit_progress("文件指纹计算完成", true);
    }

    /// 进入分片上传阶段
    ///
    /// `already_uploaded` 为服务器已持有的分片数
    pub fn begin_transfer(&mut self, total_chunks: usize, already_uploaded: usize) {
        self.fingerprint = 1.0;
        self.total_chunks = total_chunks;
        self.completed_chunks = already_uploaded.min(total_chunks);
        self.done.clear();
        self.in_flight.clear();
        self.emit_progress("开始上传分片", true);
    }

    /// 分片字节进度，已完成的分片忽略迟到的信号
    pub fn chunk_progress(&mut self, index: usize, sent_bytes: u64, total_bytes: u64) {
        if self.done.contains(index) {
            return;
        }
        let fraction = if total_bytes == 0 {
            1.0
        } else {
            (sent_bytes as f64 / total_bytes as f64).clamp(0.0, 1.0)
        };
        self.in_flight.insert(index, fraction);
        self.emit_progress("上传分片中", false);
    }

    pub fn chunk_completed(&mut self, index: usize) {
        if !self.done.insert(index) {
            return;
        }
        self.in_flight.remove(&index);
        self.completed_chunks = (self.completed_chunks + 1).min(self.total_chunks);

        self.send(UploadEvent::ChunkCompleted {
            chunk_index: index,
            completed_chunks: self.completed_chunks,
            total_chunks: self.total_chunks,
        });
        self.emit_progress("分片上传完成", true);
    }

    /// 分片重新开始（重试），不会让已上报的进度回退
    pub fn chunk_reset(&mut self, index: usize) {
        if !self.done.contains(index) {
            self.in_flight.insert(index, 0.0);
        }
    }

    pub fn chunk_retry(&mut self, index: usize, attempt: u32, delay: Duration, error: String) {
        self.chunk_reset(index);
        self.send(UploadEvent::ChunkRetry {
            chunk_index: index,
            attempt,
            delay_ms: delay.as_millis() as u64,
            error,
        });
    }

    pub fn begin_merge(&mut self) {
        self.in_flight.clear();
        self.completed_chunks = self.total_chunks;
        self.emit_progress("合并分片中", true);
    }

    /// 上传完成（合并成功或秒传），进度置为 100
    pub fn finish(&mut self, message: &str) {
        self.fingerprint = 1.0;
        self.merge = 1.0;
        self.completed_chunks = self.total_chunks;
        self.in_flight.clear();
        self.finished = true;
        self.emit_progress(message, true);
    }

    fn emit_progress(&mut self, message: &str, force: bool) {
        let value = if self.finished {
            100.0
        } else {
            self.overall().min(MAX_UNFINISHED_PROGRESS)
        };
        self.reported = self.reported.max(value);

        let emit = if force {
            self.throttler.force_emit()
        } else {
            self.throttler.should_emit()
        };
        if !emit {
            return;
        }

        self.send(UploadEvent::Progress {
            progress: self.reported,
            completed_chunks: self.completed_chunks,
            total_chunks: self.total_chunks,
            message: message.to_string(),
        });
    }

    fn send(&self, event: UploadEvent) {
        // 接收端已关闭时丢弃事件，不影响上传
        let _ = self.events.send(event);
    }
}
