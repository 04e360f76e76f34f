// 内存上传服务（测试用）
//
// 按指纹保存分片，合并时校验分片数量和整体 MD5，
// 可以按分片脚本化失败、限制接收分片数模拟连接中断

use crate::remote::{
    Artifact, CheckRequest, ChunkUploadRequest, ExistenceCheck, MergeRequest, RemoteError,
    UploadErrorKind, UploadRemote,
};
use crate::uploader::transport::ChunkProgress;
use async_trait::async_trait;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    artifacts: HashMap<String, Artifact>,
    staged: HashMap<String, BTreeMap<usize, Vec<u8>>>,
    check_calls: usize,
    chunk_calls: Vec<usize>,
    merge_calls: Vec<MergeRequest>,
    check_failure: Option<UploadErrorKind>,
    /// 分片索引 -> (错误类型, 剩余失败次数)
    chunk_failures: HashMap<usize, (UploadErrorKind, u32)>,
    merge_failure: Option<(UploadErrorKind, u32)>,
    accept_limit: Option<usize>,
    accepted: usize,
    next_id: i64,
}

#[derive(Default)]
pub(crate) struct MemoryRemote {
    state: Mutex<State>,
    chunk_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn scripted_error(kind: UploadErrorKind, what: &str) -> RemoteError {
    match kind {
        UploadErrorKind::BadRequest => RemoteError::from_status(400, format!("{}被拒绝", what)),
        UploadErrorKind::Forbidden => RemoteError::from_status(403, format!("{}无权限", what)),
        UploadErrorKind::ServerError => RemoteError::from_status(500, format!("{}服务器错误", what)),
        kind => RemoteError::new(kind, format!("{}模拟失败", what)),
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn insert_artifact(&self, md5: &str, artifact: Artifact) {
        self.state.lock().unwrap().artifacts.insert(md5.to_string(), artifact);
    }

    pub fn stage(&self, md5: &str, index: usize, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .staged
            .entry(md5.to_string())
            .or_default()
            .insert(index, data);
    }

    pub fn fail_check(&self, kind: UploadErrorKind) {
        self.state.lock().unwrap().check_failure = Some(kind);
    }

    pub fn fail_chunk(&self, index: usize, kind: UploadErrorKind, times: u32) {
        self.state.lock().unwrap().chunk_failures.insert(index, (kind, times));
    }

    pub fn fail_merge(&self, kind: UploadErrorKind, times: u32) {
        self.state.lock().unwrap().merge_failure = Some((kind, times));
    }

    /// 累计接收指定数量的分片后，后续分片都以网络错误失败
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().accept_limit = limit;
    }

    pub fn reset_calls(&self) {
        let mut state = self.state.lock().unwrap();
        state.check_calls = 0;
        state.chunk_calls.clear();
        state.merge_calls.clear();
    }

    pub fn check_calls(&self) -> usize {
        self.state.lock().unwrap().check_calls
    }

    pub fn chunk_calls(&self) -> Vec<usize> {
        self.state.lock().unwrap().chunk_calls.clone()
    }

    pub fn merge_calls(&self) -> Vec<MergeRequest> {
        self.state.lock().unwrap().merge_calls.clone()
    }

    pub fn staged_chunk(&self, md5: &str, index: usize) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .staged
            .get(md5)
            .and_then(|chunks| chunks.get(&index).cloned())
    }

    pub fn staged_indices(&self, md5: &str) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .staged
            .get(md5)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn accept_chunk(&self, request: ChunkUploadRequest) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();

        if let Some((kind, remaining)) = state.chunk_failures.get_mut(&request.chunk_index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(scripted_error(*kind, "分片上传"));
            }
        }

        if let Some(limit) = state.accept_limit {
            if state.accepted >= limit {
                return Err(RemoteError::new(UploadErrorKind::Network, "连接被重置"));
            }
        }

        state.accepted += 1;
        state
            .staged
            .entry(request.file_md5)
            .or_default()
            .insert(request.chunk_index, request.data);
        Ok(())
    }
}

#[async_trait]
impl UploadRemote for MemoryRemote {
    async fn check_existence(&self, request: &CheckRequest) -> Result<ExistenceCheck, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.check_calls += 1;

        if let Some(kind) = state.check_failure {
            return Err(scripted_error(kind, "检查文件"));
        }

        if let Some(artifact) = state.artifacts.get(&request.file_md5) {
            return Ok(ExistenceCheck::Exists(artifact.clone()));
        }

        let uploaded_chunks = state
            .staged
            .get(&request.file_md5)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default();
        Ok(ExistenceCheck::Partial { uploaded_chunks })
    }

    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        progress: ChunkProgress,
    ) -> Result<(), RemoteError> {
        self.state.lock().unwrap().chunk_calls.push(request.chunk_index);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let total = request.data.len() as u64;
        progress.report(total / 2);
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }

        let result = self.accept_chunk(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            progress.report(total);
        }
        result
    }

    async fn merge(&self, request: &MergeRequest) -> Result<Artifact, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.merge_calls.push(request.clone());

        if let Some((kind, remaining)) = state.merge_failure.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(scripted_error(*kind, "合并分片"));
            }
        }

        let chunks = state.staged.get(&request.file_md5).cloned().unwrap_or_default();
        let complete = chunks.len() == request.chunks_total
            && (0..request.chunks_total).all(|i| chunks.contains_key(&i));
        if !complete {
            return Err(RemoteError::from_status(
                400,
                format!(
                    "分片不完整，预期 {} 个，实际 {} 个",
                    request.chunks_total,
                    chunks.len()
                ),
            ));
        }

        let merged: Vec<u8> = chunks.into_values().flatten().collect();
        if merged.len() as u64 != request.file_size
            || format!("{:x}", md5::compute(&merged)) != request.file_md5
        {
            return Err(RemoteError::from_status(400, "合并后的文件校验失败"));
        }

        state.next_id += 1;
        let mut fields = Map::new();
        fields.insert("file_md5".to_string(), json!(request.file_md5));
        let artifact = Artifact {
            id: Some(state.next_id),
            title: Some(request.file_name.clone()),
            fields,
        };

        state.staged.remove(&request.file_md5);
        state
            .artifacts
            .insert(request.file_md5.clone(), artifact.clone());
        Ok(artifact)
    }
}
