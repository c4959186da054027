//! Rapid-upload negotiation / 秒传协商
//!
//! pre-hash → (server says maybe) → full hash + proof code → completed or
//! fall back to a normal multipart upload. A pre-hash mismatch is never an
//! error, it only means the bytes have to be sent.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::hash::{encode_proof, pre_hash, proof_range, HashAlgorithm};
use super::planner::TransferPlan;
use super::retry::RetryPolicy;
use super::session::UploadSession;
use super::source::UploadSource;
use super::transport::{CreateRequest, CreateResponse, FinalizeRequest, NegotiationTransport};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};

#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    pub rapid_upload: bool,
    /// Files at or below this size go straight to normal upload / 小文件直接普通上传
    pub min_size: u64,
    pub pre_hash_bytes: usize,
    pub algorithm: HashAlgorithm,
    pub temp_dir: Option<PathBuf>,
    /// Applied to create and rapid finalize / 协商请求的重试策略
    pub retry: RetryPolicy,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        Self {
            rapid_upload: true,
            min_size: 100 * 1024,
            pre_hash_bytes: 1024,
            algorithm: HashAlgorithm::Sha1,
            temp_dir: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&TransferConfig> for NegotiatorOptions {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            rapid_upload: cfg.rapid_upload,
            min_size: cfg.rapid_upload_min_size,
            pre_hash_bytes: cfg.pre_hash_bytes,
            algorithm: HashAlgorithm::Sha1,
            temp_dir: cfg.temp_dir.clone(),
            retry: cfg.retry_policy(),
        }
    }
}

/// Evidence gathered during negotiation, dropped after commit / 秒传凭证
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RapidUploadProof {
    pub pre_hash: String,
    pub full_hash: Option<String>,
    pub proof_offset: u64,
    pub proof_bytes: Vec<u8>,
    pub matched: bool,
}

#[derive(Debug)]
pub enum Negotiation {
    /// Server already had the bytes / 秒传成功
    Completed { remote_id: String },
    NeedsUpload {
        session: UploadSession,
        proof: Option<RapidUploadProof>,
    },
}

pub struct HashNegotiator {
    transport: Arc<dyn NegotiationTransport>,
    options: NegotiatorOptions,
}

impl HashNegotiator {
    pub fn new(transport: Arc<dyn NegotiationTransport>, options: NegotiatorOptions) -> Self {
        Self { transport, options }
    }

    async fn create(&self, request: &CreateRequest, cancel: &CancellationToken) -> TransferResult<CreateResponse> {
        self.options
            .retry
            .run(cancel, |_| self.transport.create(request))
            .await
    }

    /// Whether a file of `size` bytes is worth a rapid-upload attempt / 是否尝试秒传
    pub fn eligible(&self, size: u64) -> bool {
        self.options.rapid_upload && size > self.options.min_size
    }

    pub async fn negotiate(
        &self,
        source: &mut UploadSource,
        plan: &TransferPlan,
        path: &str,
        secret: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<Negotiation> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut request = CreateRequest {
            path: path.to_string(),
            size: plan.total_size,
            chunk_size: plan.chunk_size,
            part_count: plan.len(),
            pre_hash: None,
        };

        if !self.eligible(plan.total_size) {
            let resp = self.create(&request, cancel).await?;
            return Ok(Negotiation::NeedsUpload {
                session: session_from(&resp),
                proof: None,
            });
        }

        tracing::debug!("calculating pre_hash for {}", path);
        let head = source.prefix(self.options.pre_hash_bytes).await?;
        let mut proof = RapidUploadProof {
            pre_hash: pre_hash(&head),
            ..Default::default()
        };
        request.pre_hash = Some(proof.pre_hash.clone());

        let created = self.create(&request, cancel).await?;
        if !created.matched {
            return Ok(Negotiation::NeedsUpload {
                session: session_from(&created),
                proof: Some(proof),
            });
        }

        tracing::debug!("pre_hash matched for {}, trying rapid upload", path);
        proof.matched = true;
        let full_hash = source
            .full_hash(self.options.algorithm, self.options.temp_dir.as_deref(), cancel)
            .await?;

        let range = proof_range(secret, plan.total_size);
        let window = if range.is_empty() {
            Vec::new()
        } else {
            source.read_at(range.start, range.len()).await?.to_vec()
        };
        source.rewind().await?;
        proof.full_hash = Some(full_hash.clone());
        proof.proof_offset = range.start;
        proof.proof_bytes = window;

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let finalize = FinalizeRequest {
            upload_id: created.upload_id.clone(),
            file_id: created.file_id.clone(),
            full_hash: Some(full_hash),
            hash_algorithm: Some(self.options.algorithm),
            proof_code: Some(encode_proof(&proof.proof_bytes)),
            ..Default::default()
        };
        let resp = self
            .options
            .retry
            .run(cancel, |_| self.transport.finalize(&finalize))
            .await?;

        if resp.completed {
            let remote_id = resp
                .remote_id
                .or(created.file_id)
                .ok_or_else(|| TransferError::protocol("rapid upload completed without id", ""))?;
            tracing::info!("rapid upload success for {}, remote id: {}", path, remote_id);
            return Ok(Negotiation::Completed { remote_id });
        }

        tracing::debug!("rapid upload refused for {}, falling back to normal upload", path);
        let session = if resp.targets.is_empty() {
            session_from(&created)
        } else {
            UploadSession::new(
                created.upload_id.clone(),
                created.file_id.clone(),
                resp.targets,
                created.expires_in,
            )
        };
        Ok(Negotiation::NeedsUpload {
            session,
            proof: Some(proof),
        })
    }
}

fn session_from(resp: &CreateResponse) -> UploadSession {
    UploadSession::new(
        resp.upload_id.clone(),
        resp.file_id.clone(),
        resp.targets.clone(),
        resp.expires_in,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::planner::{plan, PlanConstraints};
    use crate::transfer::session::PartTarget;
    use crate::transfer::transport::{FinalizeResponse, PartSpec};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Server knowing one blob, keyed by pre-hash / 只认识一个文件的服务端
    struct KnownBlob {
        content: Vec<u8>,
        secret: String,
        finalize_calls: Mutex<Vec<FinalizeRequest>>,
        create_calls: Mutex<Vec<CreateRequest>>,
        /// Calls answered with a transient error before the real reply / 前几次调用返回暂时性错误
        flaky_creates: Mutex<u32>,
        flaky_finalizes: Mutex<u32>,
    }

    impl KnownBlob {
        fn new(content: Vec<u8>) -> Self {
            Self {
                content,
                secret: "access-token".into(),
                finalize_calls: Mutex::new(vec![]),
                create_calls: Mutex::new(vec![]),
                flaky_creates: Mutex::new(0),
                flaky_finalizes: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl NegotiationTransport for KnownBlob {
        async fn create(&self, req: &CreateRequest) -> TransferResult<CreateResponse> {
            self.create_calls.lock().push(req.clone());
            if take_flaky(&self.flaky_creates) {
                return Err(TransferError::Transient("connection reset".into()));
            }
            let matched = req.pre_hash.as_deref() == Some(pre_hash(&self.content[..1024]).as_str());
            Ok(CreateResponse {
                matched,
                upload_id: "up-1".into(),
                file_id: Some("file-1".into()),
                targets: vec![PartTarget { part_number: 1, url: "u1".into(), headers: vec![] }],
                expires_in: None,
            })
        }

        async fn finalize(&self, req: &FinalizeRequest) -> TransferResult<FinalizeResponse> {
            self.finalize_calls.lock().push(req.clone());
            if take_flaky(&self.flaky_finalizes) {
                return Err(TransferError::Transient("gateway timeout".into()));
            }
            let range = proof_range(&self.secret, self.content.len() as u64);
            let expected = encode_proof(&self.content[range.start as usize..range.end as usize]);
            let completed = req.full_hash.as_deref()
                == Some(HashAlgorithm::Sha1.digest_hex(&self.content).as_str())
                && req.proof_code.as_deref() == Some(expected.as_str());
            Ok(FinalizeResponse {
                completed,
                remote_id: completed.then(|| "file-1".to_string()),
                targets: vec![],
            })
        }

        async fn refresh_targets(&self, _: &str, _: &[PartSpec]) -> TransferResult<Vec<PartTarget>> {
            Ok(vec![])
        }
    }

    fn take_flaky(counter: &Mutex<u32>) -> bool {
        let mut left = counter.lock();
        if *left == 0 {
            return false;
        }
        *left -= 1;
        true
    }

    fn fast_retry() -> NegotiatorOptions {
        NegotiatorOptions {
            retry: RetryPolicy::new(3, std::time::Duration::from_millis(1), crate::transfer::retry::Backoff::Fixed),
            ..Default::default()
        }
    }

    fn blob(n: usize) -> Vec<u8> {
        (0..n)
            .map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect()
    }

    fn plan_for(size: u64) -> TransferPlan {
        plan(size, &PlanConstraints::new(64 * 1024, 1 << 30, 1000)).unwrap()
    }

    #[tokio::test]
    async fn test_rapid_upload_completes_from_stream() {
        let content = blob(300 * 1024);
        let server = Arc::new(KnownBlob::new(content.clone()));
        let neg = HashNegotiator::new(server.clone(), NegotiatorOptions::default());
        let mut src = UploadSource::from_bytes(Bytes::from(content.clone()));

        let out = neg
            .negotiate(&mut src, &plan_for(content.len() as u64), "/a.bin", "access-token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(out, Negotiation::Completed { ref remote_id } if remote_id == "file-1"));
        // Spooled to make the proof window reachable / 已落盘
        assert!(src.is_spooled());
    }

    #[tokio::test]
    async fn test_pre_hash_mismatch_falls_back() {
        let server = Arc::new(KnownBlob::new(blob(300 * 1024)));
        let neg = HashNegotiator::new(server.clone(), NegotiatorOptions::default());
        let other: Vec<u8> = vec![1u8; 300 * 1024];
        let mut src = UploadSource::from_bytes(Bytes::from(other));

        let out = neg
            .negotiate(&mut src, &plan_for(300 * 1024), "/b.bin", "access-token", &CancellationToken::new())
            .await
            .unwrap();
        match out {
            Negotiation::NeedsUpload { session, proof } => {
                assert_eq!(session.upload_id, "up-1");
                assert!(!proof.unwrap().matched);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.finalize_calls.lock().is_empty());
        assert!(!src.is_spooled());
    }

    #[tokio::test]
    async fn test_wrong_secret_proof_refused() {
        let content = blob(300 * 1024);
        let server = Arc::new(KnownBlob::new(content.clone()));
        let neg = HashNegotiator::new(server.clone(), NegotiatorOptions::default());
        let mut src = UploadSource::from_bytes(Bytes::from(content.clone()));

        let out = neg
            .negotiate(&mut src, &plan_for(content.len() as u64), "/a.bin", "guessed", &CancellationToken::new())
            .await
            .unwrap();
        match out {
            Negotiation::NeedsUpload { proof, .. } => {
                let proof = proof.unwrap();
                assert!(proof.matched);
                assert_eq!(proof.full_hash.unwrap(), HashAlgorithm::Sha1.digest_hex(&content));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_small_file_skips_pre_hash() {
        let server = Arc::new(KnownBlob::new(blob(300 * 1024)));
        let neg = HashNegotiator::new(server.clone(), NegotiatorOptions::default());
        let mut src = UploadSource::from_bytes(Bytes::from_static(b"tiny"));

        let out = neg
            .negotiate(&mut src, &plan_for(4), "/t.txt", "access-token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(out, Negotiation::NeedsUpload { proof: None, .. }));
        assert!(server.create_calls.lock()[0].pre_hash.is_none());

        let mut empty = UploadSource::from_bytes(Bytes::new());
        let out = neg
            .negotiate(&mut empty, &plan_for(0), "/e.txt", "access-token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(out, Negotiation::NeedsUpload { proof: None, .. }));
    }

    #[tokio::test]
    async fn test_transient_create_and_finalize_retried() {
        let content = blob(300 * 1024);
        let server = Arc::new(KnownBlob::new(content.clone()));
        *server.flaky_creates.lock() = 1;
        *server.flaky_finalizes.lock() = 1;
        let neg = HashNegotiator::new(server.clone(), fast_retry());
        let mut src = UploadSource::from_bytes(Bytes::from(content.clone()));

        let out = neg
            .negotiate(&mut src, &plan_for(content.len() as u64), "/a.bin", "access-token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(out, Negotiation::Completed { .. }));
        assert_eq!(server.create_calls.lock().len(), 2);
        assert_eq!(server.finalize_calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_attempts() {
        let server = Arc::new(KnownBlob::new(blob(300 * 1024)));
        *server.flaky_creates.lock() = 5;
        let neg = HashNegotiator::new(server.clone(), fast_retry());
        let mut src = UploadSource::from_bytes(Bytes::from_static(b"tiny"));

        let err = neg
            .negotiate(&mut src, &plan_for(4), "/t.txt", "access-token", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transient(_)));
        assert_eq!(server.create_calls.lock().len(), 3);
    }
}
