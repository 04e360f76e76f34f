// 上传服务 HTTP 客户端实现

use crate::config::RemoteConfig;
use crate::remote::{
    Artifact, CheckFileResponse, CheckRequest, ChunkUploadRequest, ChunkUploadResponse,
    ErrorBody, ExistenceCheck, MergeRequest, MergeResponse, RemoteError, UploadErrorKind,
    UploadRemote,
};
use crate::uploader::ChunkProgress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info};

/// 分片请求体按 64KB 切块发送，每发出一块上报一次进度
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 上传接口路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEndpoints {
    /// 文件状态检查
    pub check: String,
    /// 分片上传
    pub chunk: String,
    /// 分片合并
    pub merge: String,
}

impl Default for UploadEndpoints {
    fn default() -> Self {
        Self {
            check: "/videos/upload/check/".to_string(),
            chunk: "/videos/upload/chunk/".to_string(),
            merge: "/videos/upload/merge/".to_string(),
        }
    }
}

/// 上传服务 HTTP 客户端
///
/// 令牌的获取与刷新由外部负责，这里只负责在请求上附带
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    /// HTTP客户端
    client: Client,
    /// 服务根地址，如 `http://127.0.0.1:8000/api`
    base_url: String,
    /// 接口路径
    endpoints: UploadEndpoints,
    /// Bearer 令牌
    token: Option<String>,
}

impl HttpUploadClient {
    /// 创建新的上传客户端
    ///
    /// # 参数
    /// * `base_url` - 服务根地址
    /// * `timeout` - 单个请求超时时间
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化上传客户端: base_url={}, timeout={}s",
            base_url,
            timeout.as_secs()
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoints: UploadEndpoints::default(),
            token: None,
        })
    }

    /// 根据配置创建客户端
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let mut client = Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))?
            .with_endpoints(UploadEndpoints {
                check: config.check_path.clone(),
                chunk: config.chunk_path.clone(),
                merge: config.merge_path.clone(),
            });
        if let Some(ref token) = config.token {
            client = client.with_token(token.clone());
        }
        Ok(client)
    }

    /// 设置接口路径
    pub fn with_endpoints(mut self, endpoints: UploadEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// 设置 Bearer 令牌
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(self.url(path));
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 读取响应并解析 JSON
    ///
    /// 非 2xx 响应按状态码分类，优先使用响应体中的 detail 作为错误信息
    async fn read_json<T: DeserializeOwned>(response: Response, action: &str) -> Result<T, RemoteError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_request_error(&e, action))?;

        debug!("{}响应: status={}, body={}", action, status, body);

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.detail)
                .unwrap_or(body);
            error!("{}失败: status={}, detail={}", action, status, detail);
            return Err(RemoteError::from_status(
                status.as_u16(),
                format!("{}失败: {}", action, detail),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            RemoteError::invalid_response(format!("解析{}响应失败: {}, body={}", action, e, body))
        })
    }
}

/// 请求级错误分类（未拿到 HTTP 响应或响应体读取中断）
fn classify_request_error(error: &reqwest::Error, action: &str) -> RemoteError {
    let kind = if error.is_timeout() {
        UploadErrorKind::Timeout
    } else if let Some(status) = error.status() {
        UploadErrorKind::from_status(status.as_u16())
    } else {
        // 连接失败、连接被重置、响应体中断都视为网络错误
        UploadErrorKind::Network
    };

    RemoteError {
        kind,
        status: error.status().map(|s| s.as_u16()),
        message: format!("{}请求失败: {}", action, error),
    }
}

#[async_trait]
impl UploadRemote for HttpUploadClient {
    async fn check_existence(&self, request: &CheckRequest) -> Result<ExistenceCheck, RemoteError> {
        info!(
            "检查文件状态: name={}, md5={}, size={}",
            request.file_name, request.file_md5, request.file_size
        );

        let response = self
            .post(&self.endpoints.check)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, "检查文件"))?;

        let check: CheckFileResponse = Self::read_json(response, "检查文件").await?;
        Ok(check.into_existence())
    }

    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        progress: ChunkProgress,
    ) -> Result<(), RemoteError> {
        let total = request.data.len() as u64;
        let chunk_index = request.chunk_index;

        debug!(
            "上传分片: name={}, md5={}, part={}/{}, size={}",
            request.file_name, request.file_md5, chunk_index, request.chunks_total, total
        );

        // 请求体被读取时上报进度，近似已发送字节数
        let pieces: Vec<Vec<u8>> = request
            .data
            .chunks(STREAM_PIECE_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        let reporter = progress.clone();
        let mut sent = 0u64;
        let stream = futures::stream::iter(pieces).map(move |piece| {
            sent += piece.len() as u64;
            reporter.report(sent);
            Ok::<_, std::io::Error>(piece)
        });

        let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(format!("{}.part{}", request.file_md5, chunk_index))
            .mime_str("application/octet-stream")
            .map_err(|e| RemoteError::new(UploadErrorKind::Unknown, format!("构建分片请求失败: {}", e)))?;

        let form = multipart::Form::new()
            .part("chunk", part)
            .text("file_name", request.file_name)
            .text("file_md5", request.file_md5)
            .text("chunk_index", chunk_index.to_string())
            .text("chunks_total", request.chunks_total.to_string());

        let response = self
            .post(&self.endpoints.chunk)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, "上传分片"))?;

        let chunk_response: ChunkUploadResponse = Self::read_json(response, "上传分片").await?;

        if let Some(confirmed) = chunk_response.chunk_index {
            if confirmed != chunk_index {
                return Err(RemoteError::invalid_response(format!(
                    "服务器确认的分片索引不一致: 期望 {}, 实际 {}",
                    chunk_index, confirmed
                )));
            }
        }

        progress.report(total);
        debug!("上传分片成功: part={}, detail={}", chunk_index, chunk_response.detail);

        Ok(())
    }

    async fn merge(&self, request: &MergeRequest) -> Result<Artifact, RemoteError> {
        info!(
            "合并分片: name={}, md5={}, size={}, chunks={}",
            request.file_name, request.file_md5, request.file_size, request.chunks_total
        );

        let response = self
            .post(&self.endpoints.merge)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, "合并分片"))?;

        let merge: MergeResponse = Self::read_json(response, "合并分片").await?;

        let artifact = merge.video.ok_or_else(|| {
            RemoteError::invalid_response(format!("合并分片响应缺少视频记录: {}", merge.detail))
        })?;

        info!("合并分片成功: id={:?}, title={:?}", artifact.id, artifact.title);

        Ok(artifact)
    }
}
