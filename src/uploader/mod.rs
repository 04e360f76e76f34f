// 上传引擎模块
//
// 可续传、按内容寻址的分片上传：
// - 文件指纹（整体 MD5）作为服务器去重和续传的唯一键
// - 确定性分片规划，中断后按服务器已有分片续传
// - 信号量控制的并发分片上传，指数退避重试
// - 多阶段进度聚合为单调递增的事件流

pub mod chunk;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod progress;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{
    plan_chunks, read_chunk, ChunkDescriptor, ChunkPlan, FileHandle, DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use engine::{
    BackoffPolicy, UploadAttempt, UploadCoordinator, UploadOptions, UploadResult,
    DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_MAX_RETRIES,
};
pub use error::UploadError;
pub use fingerprint::{Fingerprint, FingerprintCalculator, DEFAULT_FINGERPRINT_WINDOW};
pub use progress::{
    PhaseWeights, ProgressAggregator, ProgressThrottler, UploadEvent,
    DEFAULT_PROGRESS_INTERVAL_MS,
};
pub use session::{SessionKey, UploadPhase, UploadSession, UploadStatus};
pub use transport::{ChunkProgress, ChunkTransport, TransferSignal, TransportError};
