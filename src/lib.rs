// Video Uploader Library
// 可续传视频分片上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传服务接口模块
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use remote::{Artifact, HttpUploadClient, RemoteError, UploadErrorKind, UploadRemote};
pub use uploader::{
    FileHandle, Fingerprint, UploadAttempt, UploadCoordinator, UploadError, UploadEvent,
    UploadOptions, UploadResult,
};
