//! Multipart upload coordinator / 分片上传协调器
//!
//! The coordinator owns the byte source and reads chunks in plan order; part
//! PUTs run on a bounded pool of tokio tasks (`concurrency == 1` is the plain
//! sequential loop). Workers share only the session cell (read-mostly,
//! replaced whole on renewal) and the progress counter, which is bumped and
//! reported under one lock so callbacks never see it go backwards.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::hash::{slice_digest, HashAlgorithm, PartDigest};
use super::planner::{Chunk, TransferPlan};
use super::retry::RetryPolicy;
use super::session::{SessionCell, UploadSession};
use super::source::UploadSource;
use super::transport::{classify_part_status, FinalizeRequest, NegotiationTransport, PartSpec, PartTransport};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::storage::ProgressCallback;
use crate::utils::percent;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Parallel part uploads, clamped to 1..=32 / 并发数
    pub concurrency: usize,
    /// Renew targets once the session is older than this / 会话刷新窗口
    pub renewal_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            renewal_window: Duration::from_secs(50 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&TransferConfig> for UploadOptions {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            renewal_window: cfg.renewal_window(),
            retry: cfg.retry_policy(),
        }
    }
}

/// Every part confirmed; input for the commit step / 全部分片已上传
#[derive(Debug, Clone)]
pub struct UploadedParts {
    pub session: Arc<UploadSession>,
    /// Ordered by part number / 按分片编号排序
    pub digests: Vec<PartDigest>,
    pub uploaded_bytes: u64,
}

impl UploadedParts {
    pub fn slice_digest(&self) -> String {
        slice_digest(&self.digests)
    }
}

pub struct UploadCoordinator {
    negotiation: Arc<dyn NegotiationTransport>,
    parts: Arc<dyn PartTransport>,
    options: UploadOptions,
}

/// Everything a part worker needs, cloned per task / 分片任务上下文
#[derive(Clone)]
struct PartWorker {
    cell: Arc<SessionCell>,
    negotiation: Arc<dyn NegotiationTransport>,
    parts: Arc<dyn PartTransport>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    completed: Arc<Mutex<u64>>,
    total: u64,
    progress: Option<ProgressCallback>,
}

impl UploadCoordinator {
    pub fn new(
        negotiation: Arc<dyn NegotiationTransport>,
        parts: Arc<dyn PartTransport>,
        mut options: UploadOptions,
    ) -> Self {
        options.concurrency = options.concurrency.clamp(1, 32);
        Self {
            negotiation,
            parts,
            options,
        }
    }

    /// Upload every chunk of `plan` / 上传全部分片
    ///
    /// Cancellation is checked before each chunk is dispatched; parts already
    /// in flight are drained before returning `TransferError::Cancelled`.
    pub async fn upload(
        &self,
        source: &mut UploadSource,
        plan: &TransferPlan,
        session: UploadSession,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> TransferResult<UploadedParts> {
        let worker = PartWorker {
            cell: Arc::new(SessionCell::new(session)),
            negotiation: self.negotiation.clone(),
            parts: self.parts.clone(),
            retry: self.options.retry.clone(),
            cancel: cancel.clone(),
            completed: Arc::new(Mutex::new(0)),
            total: plan.total_size,
            progress,
        };

        let mut tasks: JoinSet<(u32, TransferResult<PartDigest>)> = JoinSet::new();
        let mut digests: BTreeMap<u32, PartDigest> = BTreeMap::new();
        let mut first_error: Option<TransferError> = None;

        for chunk in &plan.chunks {
            while tasks.len() >= self.options.concurrency {
                match tasks.join_next().await {
                    Some(joined) => record(joined, &mut digests, &mut first_error),
                    None => break,
                }
            }
            if first_error.is_some() || cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.renew_if_stale(&worker, plan, &digests).await {
                first_error.get_or_insert(e);
                break;
            }

            let data = match source.read_chunk(chunk).await {
                Ok(data) => data,
                Err(e) => {
                    first_error.get_or_insert(e);
                    break;
                }
            };

            // Checked again: reading a chunk may take a while / 读取后再次检查取消
            if cancel.is_cancelled() {
                break;
            }

            let w = worker.clone();
            let chunk = *chunk;
            tasks.spawn(async move {
                let part_number = chunk.part_number();
                (part_number, w.upload_part(chunk, data).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            record(joined, &mut digests, &mut first_error);
        }

        if cancel.is_cancelled() {
            tracing::warn!(
                "upload {} cancelled after {} of {} parts",
                worker.cell.current().upload_id,
                digests.len(),
                plan.len()
            );
            return Err(TransferError::Cancelled);
        }
        if let Some(e) = first_error {
            tracing::error!("upload {} failed: {}", worker.cell.current().upload_id, e);
            return Err(e);
        }
        if digests.len() != plan.len() {
            return Err(TransferError::protocol(
                "not every part was confirmed",
                format!("confirmed={}, planned={}", digests.len(), plan.len()),
            ));
        }

        let uploaded_bytes = *worker.completed.lock();
        Ok(UploadedParts {
            session: worker.cell.current(),
            digests: digests.into_values().collect(),
            uploaded_bytes,
        })
    }

    /// Renew targets of parts not yet confirmed once the window has passed
    /// 超过刷新窗口时刷新未完成分片的上传地址
    async fn renew_if_stale(
        &self,
        worker: &PartWorker,
        plan: &TransferPlan,
        confirmed: &BTreeMap<u32, PartDigest>,
    ) -> TransferResult<()> {
        let session = worker.cell.current();
        if session.target_count() == 0 || !session.is_stale(self.options.renewal_window) {
            return Ok(());
        }

        let pending: Vec<PartSpec> = plan
            .chunks
            .iter()
            .filter(|c| !confirmed.contains_key(&c.part_number()))
            .map(|c| PartSpec {
                part_number: c.part_number(),
                length: c.length,
                md5_base64: None,
            })
            .collect();
        let cell = &worker.cell;
        let negotiation = worker.negotiation.as_ref();
        let pending = &pending;
        let window = self.options.renewal_window;
        self.options
            .retry
            .run(&worker.cancel, |_| async move {
                cell.renew_stale(window, negotiation, pending).await.map(|_| ())
            })
            .await
    }

    /// Commit the upload; failures are returned as-is, never retried
    /// 提交上传（失败不自动重试）
    pub async fn commit(
        &self,
        uploaded: &UploadedParts,
        full_hash: Option<(HashAlgorithm, String)>,
    ) -> TransferResult<String> {
        let (hash_algorithm, full_hash) = match full_hash {
            Some((alg, hash)) => (Some(alg), Some(hash)),
            None => (None, None),
        };
        let req = FinalizeRequest {
            upload_id: uploaded.session.upload_id.clone(),
            file_id: uploaded.session.file_id.clone(),
            full_hash,
            hash_algorithm,
            proof_code: None,
            part_digests: uploaded.digests.clone(),
            slice_digest: Some(uploaded.slice_digest()),
        };
        let resp = self.negotiation.finalize(&req).await?;
        if !resp.completed {
            return Err(TransferError::protocol(
                "commit not acknowledged",
                serde_json::to_string(&resp).unwrap_or_default(),
            ));
        }
        let remote_id = resp
            .remote_id
            .or_else(|| uploaded.session.file_id.clone())
            .ok_or_else(|| TransferError::protocol("commit returned no remote id", ""))?;
        tracing::info!(
            "upload {} committed as {} ({} parts)",
            uploaded.session.upload_id,
            remote_id,
            uploaded.digests.len()
        );
        Ok(remote_id)
    }
}

fn record(
    joined: Result<(u32, TransferResult<PartDigest>), tokio::task::JoinError>,
    digests: &mut BTreeMap<u32, PartDigest>,
    first_error: &mut Option<TransferError>,
) {
    match joined {
        Ok((part_number, Ok(digest))) => {
            digests.insert(part_number, digest);
        }
        Ok((part_number, Err(e))) => {
            tracing::error!("part {} failed: {}", part_number, e);
            first_error.get_or_insert(e);
        }
        Err(join_err) => {
            first_error.get_or_insert(TransferError::protocol(
                "part worker panicked",
                join_err.to_string(),
            ));
        }
    }
}

impl PartWorker {
    async fn upload_part(&self, chunk: Chunk, data: Bytes) -> TransferResult<PartDigest> {
        let part_number = chunk.part_number();
        let digest = PartDigest::compute(part_number, &data);
        let spec = PartSpec {
            part_number,
            length: chunk.length,
            md5_base64: Some(digest.md5_base64.clone()),
        };

        let spec_ref = &spec;
        let data_ref = &data;
        self.retry
            .run(&self.cancel, |attempt| async move {
                let (_, target) = self
                    .cell
                    .ensure_target(spec_ref, self.negotiation.as_ref())
                    .await?;
                // Nothing new goes on the wire after cancellation / 取消后不再发起新请求
                if self.cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                let status = self.parts.put(&target, data_ref.clone()).await?;
                match classify_part_status(status) {
                    Err(TransferError::SessionExpired(msg)) => {
                        tracing::warn!(
                            "part {} target expired on attempt {}: {}",
                            part_number,
                            attempt,
                            msg
                        );
                        self.cell
                            .replace_rejected(&target, self.negotiation.as_ref(), spec_ref)
                            .await?;
                        Err(TransferError::SessionExpired(msg))
                    }
                    other => other,
                }
            })
            .await?;

        {
            let mut completed = self.completed.lock();
            *completed += chunk.length;
            let done = *completed;
            tracing::debug!(
                "part {} uploaded, {}/{} bytes ({}%)",
                part_number,
                done,
                self.total,
                percent(done, self.total)
            );
            // Reported under the lock so totals arrive in order / 持锁回调保证进度单调
            if let Some(cb) = &self.progress {
                cb(done, self.total);
            }
        }
        Ok(digest)
    }
}
