// 上传协调器
//
// 核心功能：
// 1. 计算文件指纹
// 2. 检查文件状态（秒传 / 获取服务器已有分片）
// 3. 并发上传剩余分片，错误分类和指数退避重试
// 4. 全部分片确认后合并
//
// 状态流转：
// Idle → Fingerprinting → CheckingExistence → {ShortCircuitComplete | Resuming}
//      → Transferring → Merging → Completed，任意非终态都可能转为 Failed
//
// 并发上传策略：
// - 使用 Semaphore 控制最大并发分片数，拿到许可后才派发分片
// - 使用 JoinSet 管理分片任务
// - 分片完成记录只在协调器任务中修改，不需要加锁

use crate::remote::{Artifact, ExistenceCheck, MergeRequest, UploadErrorKind, UploadRemote};
use crate::uploader::chunk::{ChunkDescriptor, ChunkPlan, FileHandle, DEFAULT_UPLOAD_CHUNK_SIZE};
use crate::uploader::error::UploadError;
use crate::uploader::fingerprint::{FingerprintCalculator, DEFAULT_FINGERPRINT_WINDOW};
use crate::uploader::progress::{
    PhaseWeights, ProgressAggregator, UploadEvent, DEFAULT_PROGRESS_INTERVAL_MS,
};
use crate::uploader::session::{SessionKey, UploadPhase, UploadSession, UploadStatus};
use crate::uploader::transport::{ChunkTransport, TransferSignal, TransportError};
use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =====================================================
// 重试配置
// =====================================================

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认最大并发分片数
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 3;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的最短等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 指数退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// 初始延迟
    pub initial: Duration,
    /// 最大延迟
    pub max: Duration,
    /// 限流时的最短等待时间
    pub rate_limited: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            max: Duration::from_millis(MAX_BACKOFF_MS),
            rate_limited: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
        }
    }
}

impl BackoffPolicy {
    /// 计算指数退避延迟
    ///
    /// # 延迟序列（默认配置）
    /// - retry=0: 100ms
    /// - retry=1: 200ms
    /// - retry=2: 400ms
    /// - retry=3: 800ms
    /// - 最大: 5000ms
    pub fn delay(&self, retry: u32, error_kind: &UploadErrorKind) -> Duration {
        let initial_ms = self.initial.as_millis() as u64;
        let base_delay = initial_ms.saturating_mul(2u64.saturating_pow(retry));
        let delay = Duration::from_millis(base_delay).min(self.max);

        // 限流时使用更长的等待时间
        if matches!(error_kind, UploadErrorKind::RateLimited) {
            delay.max(self.rate_limited)
        } else {
            delay
        }
    }
}

// =====================================================
// 上传参数与结果
// =====================================================

/// 上传参数
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 分片大小
    pub chunk_size: NonZeroU64,
    /// 最大并发分片数
    pub max_concurrent_chunks: usize,
    /// 单个分片的最大重试次数（0 表示失败立即终止）
    pub max_retries: u32,
    /// 指纹读取窗口
    pub fingerprint_window: usize,
    /// 进度权重
    pub weights: PhaseWeights,
    /// 分片内进度事件的节流间隔
    pub progress_interval: Duration,
    /// 退避策略
    pub backoff: BackoffPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: NonZeroU64::new(DEFAULT_UPLOAD_CHUNK_SIZE).unwrap_or(NonZeroU64::MIN),
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_retries: DEFAULT_MAX_RETRIES,
            fingerprint_window: DEFAULT_FINGERPRINT_WINDOW,
            weights: PhaseWeights::default(),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl UploadOptions {
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::InvalidConfig(
                "最大并发分片数必须大于 0".to_string(),
            ));
        }
        if self.fingerprint_window == 0 {
            return Err(UploadError::InvalidConfig(
                "指纹读取窗口必须大于 0".to_string(),
            ));
        }
        self.weights.validate().map_err(UploadError::InvalidConfig)
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq)]
pub enum UploadResult {
    /// 服务器已有相同文件（秒传）
    Existing(Artifact),
    /// 分片上传并合并完成
    Merged(Artifact),
}

impl UploadResult {
    pub fn artifact(&self) -> &Artifact {
        match self {
            UploadResult::Existing(a) | UploadResult::Merged(a) => a,
        }
    }
}

/// 一次上传尝试
///
/// `events` 在尝试结束后关闭，`outcome` 给出唯一的最终结果
pub struct UploadAttempt {
    pub events: UnboundedReceiver<UploadEvent>,
    pub outcome: JoinHandle<Result<UploadResult, UploadError>>,
}

impl UploadAttempt {
    /// 等待最终结果（任务异常转为 Worker 错误）
    pub async fn join(self) -> Result<UploadResult, UploadError> {
        self.outcome
            .await
            .map_err(|e| UploadError::Worker(format!("上传任务异常: {}", e)))?
    }
}

/// 单次尝试的运行状态
struct Attempt {
    id: String,
    status: UploadStatus,
    progress: ProgressAggregator,
}

impl Attempt {
    /// 状态转换，非法转换被拒绝
    fn transition(&mut self, next: UploadStatus, session: Option<&mut UploadSession>) -> bool {
        if !self.status.can_transition_to(next) {
            error!(
                "[上传#{}] 拒绝非法状态转换: {:?} -> {:?}",
                self.id, self.status, next
            );
            return false;
        }

        let old = self.status;
        self.status = next;
        if let Some(session) = session {
            session.set_status(next);
        }

        debug!("[上传#{}] 状态变更: {:?} -> {:?}", self.id, old, next);
        self.progress.status_changed(old, next);
        true
    }
}

// =====================================================
// 上传协调器
// =====================================================

/// 上传协调器
///
/// 负责协调单个文件的上传过程，包括：
/// - 指纹计算
/// - 秒传检查与断点续传
/// - 分片并发上传与错误重试
/// - 合并分片
pub struct UploadCoordinator {
    remote: Arc<dyn UploadRemote>,
    transport: ChunkTransport,
    fingerprinter: FingerprintCalculator,
    options: UploadOptions,
}

impl UploadCoordinator {
    pub fn new(remote: Arc<dyn UploadRemote>, options: UploadOptions) -> Result<Self, UploadError> {
        options.validate()?;

        Ok(Self {
            transport: ChunkTransport::new(remote.clone()),
            fingerprinter: FingerprintCalculator::new(options.fingerprint_window),
            remote,
            options,
        })
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// 在后台任务中执行一次上传
    pub fn spawn_upload(self: &Arc<Self>, file: FileHandle) -> UploadAttempt {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::clone(self);
        let outcome = tokio::spawn(async move { coordinator.start_upload(&file, tx).await });

        UploadAttempt {
            events: rx,
            outcome,
        }
    }

    /// 执行一次上传
    ///
    /// 事件按顺序发送到 `events`，函数返回后发送端被丢弃，事件流结束
    pub async fn start_upload(
        &self,
        file: &FileHandle,
        events: UnboundedSender<UploadEvent>,
    ) -> Result<UploadResult, UploadError> {
        let mut attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            status: UploadStatus::Idle,
            progress: ProgressAggregator::new(
                events,
                self.options.weights,
                self.options.progress_interval,
            ),
        };

        info!(
            "[上传#{}] 开始上传: path={:?}, name={}, size={}",
            attempt.id, file.path, file.name, file.size
        );

        let result = self.run(file, &mut attempt).await;

        match result {
            Ok(ref r) => {
                info!(
                    "[上传#{}] 上传成功: {}, id={:?}",
                    attempt.id,
                    match r {
                        UploadResult::Existing(_) => "秒传",
                        UploadResult::Merged(_) => "合并完成",
                    },
                    r.artifact().id
                );
            }
            Err(ref e) => {
                error!(
                    "[上传#{}] 上传失败（{}阶段）: {}",
                    attempt.id,
                    e.phase(),
                    e
                );
                if !attempt.status.is_terminal() {
                    attempt.transition(UploadStatus::Failed, None);
                }
            }
        }

        result
    }

    /// 单独重新合并（分片都已在服务器上，不会重新上传）
    pub async fn retry_merge(&self, request: &MergeRequest) -> Result<Artifact, UploadError> {
        info!(
            "重新合并分片: name={}, md5={}, chunks={}",
            request.file_name, request.file_md5, request.chunks_total
        );

        self.remote
            .merge(request)
            .await
            .map_err(|source| UploadError::Merge {
                source,
                request: request.clone(),
            })
    }

    async fn run(&self, file: &FileHandle, attempt: &mut Attempt) -> Result<UploadResult, UploadError> {
        // 服务器无法合并 0 个分片
        if file.size == 0 {
            return Err(UploadError::EmptyFile);
        }

        // 1. 计算文件指纹
        attempt.transition(UploadStatus::Fingerprinting, None);
        let fingerprint = {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let compute = self.fingerprinter.compute(file, tx);
            let progress = &mut attempt.progress;
            let drain = async move {
                while let Some(fraction) = rx.recv().await {
                    progress.fingerprint_progress(fraction);
                }
            };
            let (result, ()) = tokio::join!(compute, drain);
            result.map_err(|source| UploadError::Io {
                phase: UploadPhase::Fingerprinting,
                source,
            })?
        };
        attempt.progress.fingerprint_done();

        let plan = ChunkPlan::new(file.size, self.options.chunk_size);
        let key = Arc::new(SessionKey {
            fingerprint,
            file_name: file.name.clone(),
            file_size: file.size,
            chunk_size: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
        });

        // 2. 检查文件状态
        attempt.transition(UploadStatus::CheckingExistence, None);
        let existence = self
            .remote
            .check_existence(&key.check_request())
            .await
            .map_err(UploadError::CheckExistence)?;

        let uploaded_chunks = match existence {
            ExistenceCheck::Exists(artifact) => {
                info!(
                    "[上传#{}] 秒传成功: md5={}, id={:?}",
                    attempt.id, key.fingerprint, artifact.id
                );
                attempt.transition(UploadStatus::ShortCircuitComplete, None);
                attempt.progress.finish("秒传成功");
                return Ok(UploadResult::Existing(artifact));
            }
            ExistenceCheck::Partial { uploaded_chunks } => uploaded_chunks,
        };

        // 3. 续传
        let mut session = UploadSession::new(key.clone(), &uploaded_chunks);
        attempt.transition(UploadStatus::Resuming, Some(&mut session));
        info!(
            "[上传#{}] 服务器已有 {}/{} 个分片",
            attempt.id,
            session.resume_set().len(),
            key.total_chunks
        );

        match self.transfer_and_merge(file, &plan, &mut session, attempt).await {
            Ok(artifact) => Ok(UploadResult::Merged(artifact)),
            Err(e) => {
                session.set_status(UploadStatus::Failed);
                Err(e)
            }
        }
    }

    async fn transfer_and_merge(
        &self,
        file: &FileHandle,
        plan: &ChunkPlan,
        session: &mut UploadSession,
        attempt: &mut Attempt,
    ) -> Result<Artifact, UploadError> {
        attempt.transition(UploadStatus::Transferring, Some(&mut *session));
        attempt
            .progress
            .begin_transfer(plan.total_chunks(), session.accounted_count());

        self.transfer(file, plan, session, attempt).await?;

        // 4. 合并分片
        attempt.transition(UploadStatus::Merging, Some(&mut *session));
        attempt.progress.begin_merge();

        let request = session.key.merge_request();
        let artifact = self
            .remote
            .merge(&request)
            .await
            .map_err(|source| UploadError::Merge {
                source,
                request: request.clone(),
            })?;

        attempt.transition(UploadStatus::Completed, Some(&mut *session));
        attempt.progress.finish("上传完成");

        Ok(artifact)
    }

    /// 并发上传待传分片
    ///
    /// 按索引升序派发；任一分片最终失败时终止其余分片并返回错误
    async fn transfer(
        &self,
        file: &FileHandle,
        plan: &ChunkPlan,
        session: &mut UploadSession,
        attempt: &mut Attempt,
    ) -> Result<(), UploadError> {
        let mut queue: VecDeque<ChunkDescriptor> = plan.pending(session.resume_set()).into();
        let max_concurrent = self.options.max_concurrent_chunks;

        info!(
            "[上传#{}] 开始上传 {} 个分片，并发数: {}",
            attempt.id,
            queue.len(),
            max_concurrent
        );

        // 信号量控制并发数
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let mut join_set: JoinSet<Result<usize, UploadError>> = JoinSet::new();
        let file = Arc::new(file.clone());

        loop {
            if queue.is_empty() && join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(signal) = signal_rx.recv() => {
                    Self::apply_signal(signal, attempt);
                }

                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok(Ok(index))) => {
                            session.mark_completed(index);
                            attempt.progress.chunk_completed(index);
                            info!(
                                "[分片#{}] ✓ 上传成功 ({}/{} 完成)",
                                index,
                                session.accounted_count(),
                                plan.total_chunks()
                            );
                        }
                        Some(Ok(Err(e))) => {
                            join_set.abort_all();
                            return Err(e);
                        }
                        Some(Err(e)) => {
                            join_set.abort_all();
                            return Err(UploadError::Worker(e.to_string()));
                        }
                        None => {}
                    }
                }

                permit = semaphore.clone().acquire_owned(), if !queue.is_empty() => {
                    let permit = permit.map_err(|e| UploadError::Worker(format!("并发控制异常: {}", e)))?;
                    let Some(chunk) = queue.pop_front() else {
                        continue;
                    };
                    if !session.mark_dispatched(chunk.index) {
                        continue;
                    }

                    let worker = ChunkWorker {
                        transport: self.transport.clone(),
                        file: file.clone(),
                        key: session.key.clone(),
                        chunk,
                        max_retries: self.options.max_retries,
                        backoff: self.options.backoff,
                        signals: signal_tx.clone(),
                    };
                    join_set.spawn(async move {
                        // 许可在分片结束（包括重试）后释放
                        let _permit = permit;
                        worker.run().await
                    });
                }
            }
        }

        if !session.all_accounted() {
            return Err(UploadError::Worker(format!(
                "分片未全部完成: {}/{}",
                session.accounted_count(),
                plan.total_chunks()
            )));
        }

        info!(
            "[上传#{}] 所有 {} 个分片已在服务器上",
            attempt.id,
            plan.total_chunks()
        );
        Ok(())
    }

    fn apply_signal(signal: TransferSignal, attempt: &mut Attempt) {
        match signal {
            TransferSignal::Progress {
                index,
                sent_bytes,
                total_bytes,
            } => attempt.progress.chunk_progress(index, sent_bytes, total_bytes),
            TransferSignal::Retrying {
                index,
                attempt: retry,
                delay,
                error,
            } => attempt.progress.chunk_retry(index, retry, delay, error),
        }
    }
}

/// 单个分片的上传任务（带重试）
struct ChunkWorker {
    transport: ChunkTransport,
    file: Arc<FileHandle>,
    key: Arc<SessionKey>,
    chunk: ChunkDescriptor,
    max_retries: u32,
    backoff: BackoffPolicy,
    signals: UnboundedSender<TransferSignal>,
}

impl ChunkWorker {
    async fn run(self) -> Result<usize, UploadError> {
        let index = self.chunk.index;

        debug!(
            "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
            index,
            self.chunk.start,
            self.chunk.end.saturating_sub(1),
            self.chunk.size
        );

        let mut retry = 0u32;
        loop {
            let error = match self
                .transport
                .send_chunk(&self.file, &self.chunk, &self.key, self.signals.clone())
                .await
            {
                Ok(()) => return Ok(index),
                Err(e) => e,
            };

            let attempts = retry + 1;
            let retriable_kind = match error {
                TransportError::Remote(ref e) if e.is_retriable() => Some(e.kind),
                _ => None,
            };

            match retriable_kind {
                Some(kind) if retry < self.max_retries => {
                    let delay = self.backoff.delay(retry, &kind);
                    warn!(
                        "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                        index,
                        delay.as_millis(),
                        retry + 1,
                        self.max_retries,
                        error
                    );
                    let _ = self.signals.send(TransferSignal::Retrying {
                        index,
                        attempt: attempts,
                        delay,
                        error: error.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Some(_) => {
                    error!(
                        "[分片#{}] 上传失败，已达最大重试次数 ({}): {}",
                        index, self.max_retries, error
                    );
                    return Err(UploadError::from_transport(index, attempts, error));
                }
                None => {
                    error!("[分片#{}] 上传失败（不可重试）: {}", index, error);
                    return Err(UploadError::from_transport(index, attempts, error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::testing::MemoryRemote;
    use serde_json::Map;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_options(chunk_size: u64) -> UploadOptions {
        UploadOptions {
            chunk_size: NonZeroU64::new(chunk_size).unwrap(),
            max_concurrent_chunks: 2,
            max_retries: 3,
            fingerprint_window: 256,
            weights: PhaseWeights::default(),
            progress_interval: Duration::ZERO,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                rate_limited: Duration::from_millis(5),
            },
        }
    }

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn temp_upload_file(data: &[u8]) -> (NamedTempFile, FileHandle) {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(data).unwrap();
        tmp.flush().unwrap();
        let file = FileHandle::open(tmp.path()).await.unwrap();
        (tmp, file)
    }

    fn md5_hex(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    async fn run_upload(
        coordinator: &Arc<UploadCoordinator>,
        file: &FileHandle,
    ) -> (Vec<UploadEvent>, Result<UploadResult, UploadError>) {
        let mut attempt = coordinator.spawn_upload(file.clone());
        let mut events = Vec::new();
        while let Some(event) = attempt.events.recv().await {
            events.push(event);
        }
        (events, attempt.join().await)
    }

    fn statuses(events: &[UploadEvent]) -> Vec<UploadStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::StatusChanged { new_status, .. } => Some(*new_status),
                _ => None,
            })
            .collect()
    }

    fn progress_values(events: &[UploadEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let backoff = BackoffPolicy::default();

        // 普通错误的退避延迟
        assert_eq!(backoff.delay(0, &UploadErrorKind::Network).as_millis(), 100);
        assert_eq!(backoff.delay(1, &UploadErrorKind::Network).as_millis(), 200);
        assert_eq!(backoff.delay(2, &UploadErrorKind::Network).as_millis(), 400);
        assert_eq!(backoff.delay(3, &UploadErrorKind::Network).as_millis(), 800);
        assert_eq!(backoff.delay(10, &UploadErrorKind::Network).as_millis(), 5000); // 超过最大值
        assert_eq!(backoff.delay(200, &UploadErrorKind::Timeout).as_millis(), 5000);

        // 限流错误使用更长的等待时间
        assert_eq!(
            backoff.delay(0, &UploadErrorKind::RateLimited).as_millis(),
            10000
        );
    }

    #[test]
    fn test_options_validation() {
        assert!(UploadOptions::default().validate().is_ok());

        let mut options = UploadOptions::default();
        options.max_concurrent_chunks = 0;
        assert!(matches!(
            options.validate(),
            Err(UploadError::InvalidConfig(_))
        ));

        let mut options = UploadOptions::default();
        options.weights.merge = 0.5;
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_resume_only_uploads_missing_chunks() {
        let data = sample_data(5 * 1024);
        let md5 = md5_hex(&data);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        for index in 0..3 {
            remote.stage(&md5, index, data[index * 1024..(index + 1) * 1024].to_vec());
        }

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        let result = result.unwrap();
        assert!(matches!(result, UploadResult::Merged(_)));

        let mut calls = remote.chunk_calls();
        calls.sort_unstable();
        assert_eq!(calls, vec![3, 4]);

        let merges = remote.merge_calls();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].chunks_total, 5);
        assert_eq!(merges[0].file_md5, md5);

        assert_eq!(
            statuses(&events),
            vec![
                UploadStatus::Fingerprinting,
                UploadStatus::CheckingExistence,
                UploadStatus::Resuming,
                UploadStatus::Transferring,
                UploadStatus::Merging,
                UploadStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_when_file_exists() {
        let data = sample_data(3000);
        let md5 = md5_hex(&data);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.insert_artifact(
            &md5,
            Artifact {
                id: Some(9),
                title: Some("existing".to_string()),
                fields: Map::new(),
            },
        );

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        match result.unwrap() {
            UploadResult::Existing(artifact) => assert_eq!(artifact.id, Some(9)),
            other => panic!("应为秒传: {:?}", other),
        }
        assert!(remote.chunk_calls().is_empty());
        assert!(remote.merge_calls().is_empty());
        assert_eq!(remote.check_calls(), 1);

        assert_eq!(
            statuses(&events).last().copied(),
            Some(UploadStatus::ShortCircuitComplete)
        );
        assert_eq!(progress_values(&events).last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_progress_monotonic_and_reaches_hundred_after_merge() {
        let data = sample_data(8 * 1024 + 100);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;
        assert!(result.is_ok());

        let values = progress_values(&events);
        assert!(!values.is_empty());
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values.iter().all(|v| (0.0..=100.0).contains(v)));
        assert_eq!(values.last().copied(), Some(100.0));
        assert_eq!(values.iter().filter(|v| **v >= 100.0).count(), 1);

        // 100 只出现在合并开始之后
        let merging_at = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    UploadEvent::StatusChanged {
                        new_status: UploadStatus::Merging,
                        ..
                    }
                )
            })
            .unwrap();
        let hundred_at = events
            .iter()
            .position(|e| matches!(e, UploadEvent::Progress { progress, .. } if *progress >= 100.0))
            .unwrap();
        assert!(hundred_at > merging_at);

        let completed = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::ChunkCompleted { .. }))
            .count();
        assert_eq!(completed, 9);
    }

    #[tokio::test]
    async fn test_permanent_chunk_failure_aborts_without_merge() {
        let data = sample_data(5 * 1024);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_chunk(2, UploadErrorKind::BadRequest, u32::MAX);

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        let err = result.unwrap_err();
        assert_eq!(err.phase(), UploadPhase::Transferring);
        assert!(err.is_rejection());
        assert!(matches!(
            err,
            UploadError::Transfer {
                index: 2,
                attempts: 1,
                ..
            }
        ));

        // 不可重试的错误只尝试一次
        assert_eq!(remote.chunk_calls().iter().filter(|i| **i == 2).count(), 1);
        assert!(remote.merge_calls().is_empty());
        assert_eq!(statuses(&events).last().copied(), Some(UploadStatus::Failed));
        assert!(progress_values(&events).iter().all(|v| *v < 100.0));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let data = sample_data(4 * 1024);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_chunk(1, UploadErrorKind::ServerError, 2);

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        assert!(matches!(result.unwrap(), UploadResult::Merged(_)));
        assert_eq!(remote.chunk_calls().iter().filter(|i| **i == 1).count(), 3);

        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::ChunkRetry {
                    chunk_index: 1,
                    attempt,
                    ..
                } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let data = sample_data(2 * 1024);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_chunk(0, UploadErrorKind::Network, u32::MAX);

        let mut options = test_options(1024);
        options.max_retries = 2;
        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), options).unwrap());
        let (_events, result) = run_upload(&coordinator, &file).await;

        let err = result.unwrap_err();
        assert!(err.is_retriable());
        assert!(matches!(
            err,
            UploadError::Transfer {
                index: 0,
                attempts: 3,
                ..
            }
        ));
        assert!(remote.merge_calls().is_empty());
    }

    #[tokio::test]
    async fn test_merge_failure_then_retry_merge() {
        let data = sample_data(5 * 1024);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_merge(UploadErrorKind::ServerError, 1);

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        let err = result.unwrap_err();
        assert_eq!(err.phase(), UploadPhase::Merging);
        assert!(err.is_retriable());
        assert_eq!(statuses(&events).last().copied(), Some(UploadStatus::Failed));

        let request = err.merge_request().cloned().unwrap();
        assert_eq!(request.chunks_total, 5);

        let artifact = coordinator.retry_merge(&request).await.unwrap();
        assert!(artifact.id.is_some());

        // 重新合并不会重新上传分片
        assert_eq!(remote.chunk_calls().len(), 5);
        assert_eq!(remote.merge_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let data = sample_data(8 * 1024);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new().with_chunk_delay(Duration::from_millis(20)));
        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (_events, result) = run_upload(&coordinator, &file).await;

        assert!(result.is_ok());
        assert_eq!(remote.chunk_calls().len(), 8);
        assert!(remote.max_in_flight() <= 2);
        assert!(remote.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let (_tmp, file) = temp_upload_file(b"").await;

        let remote = Arc::new(MemoryRemote::new());
        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (events, result) = run_upload(&coordinator, &file).await;

        assert!(matches!(result, Err(UploadError::EmptyFile)));
        assert_eq!(remote.check_calls(), 0);
        assert_eq!(statuses(&events), vec![UploadStatus::Failed]);
    }

    #[tokio::test]
    async fn test_check_failure_is_checking_phase() {
        let data = sample_data(100);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_check(UploadErrorKind::Forbidden);

        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), test_options(1024)).unwrap());
        let (_events, result) = run_upload(&coordinator, &file).await;

        let err = result.unwrap_err();
        assert_eq!(err.phase(), UploadPhase::CheckingExistence);
        assert!(err.is_rejection());
        assert!(remote.chunk_calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_end_to_end() {
        // 10MB 文件，2MB 分片
        let data = sample_data(10 * 1024 * 1024);
        let md5 = md5_hex(&data);
        let (_tmp, file) = temp_upload_file(&data).await;

        let remote = Arc::new(MemoryRemote::new());
        // 服务器接收 3 个分片后连接中断
        remote.set_accept_limit(Some(3));

        let mut options = UploadOptions::default();
        options.max_concurrent_chunks = 1;
        options.max_retries = 0;
        options.progress_interval = Duration::ZERO;
        let coordinator = Arc::new(UploadCoordinator::new(remote.clone(), options).unwrap());

        let (_events, result) = run_upload(&coordinator, &file).await;
        let err = result.unwrap_err();
        assert_eq!(err.phase(), UploadPhase::Transferring);
        assert!(err.is_retriable());
        assert_eq!(remote.staged_indices(&md5), vec![0, 1, 2]);
        assert!(remote.merge_calls().is_empty());

        // 网络恢复后重新上传
        remote.set_accept_limit(None);
        remote.reset_calls();

        let (events, result) = run_upload(&coordinator, &file).await;
        let result = result.unwrap();
        assert!(matches!(result, UploadResult::Merged(_)));
        assert_eq!(
            result.artifact().fields.get("file_md5"),
            Some(&serde_json::json!(md5))
        );

        assert_eq!(remote.chunk_calls(), vec![3, 4]);
        let merges = remote.merge_calls();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].chunks_total, 5);
        assert_eq!(merges[0].file_size, 10 * 1024 * 1024);
        assert_eq!(progress_values(&events).last().copied(), Some(100.0));
    }
}
