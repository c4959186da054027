//! Put control flow: plan → negotiate → upload → commit / 上传总流程

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::hash::HashAlgorithm;
use super::negotiate::{HashNegotiator, Negotiation, NegotiatorOptions};
use super::planner::plan;
use super::source::UploadSource;
use super::transport::{NegotiationTransport, PartTransport};
use super::upload::{UploadCoordinator, UploadOptions};
use crate::config::TransferConfig;
use crate::error::TransferResult;
use crate::storage::ProgressCallback;

/// Result of one `put` / 上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub remote_id: String,
    /// Completed by rapid upload, no part was sent / 是否秒传
    pub rapid: bool,
    pub uploaded_bytes: u64,
}

/// One driver's upload pipeline / 单个驱动的上传管线
pub struct TransferEngine {
    config: TransferConfig,
    negotiation: Arc<dyn NegotiationTransport>,
    parts: Arc<dyn PartTransport>,
}

impl TransferEngine {
    pub fn new(
        config: TransferConfig,
        negotiation: Arc<dyn NegotiationTransport>,
        parts: Arc<dyn PartTransport>,
    ) -> Self {
        Self {
            config,
            negotiation,
            parts,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Upload `source` to `path` / 上传文件
    ///
    /// `secret` seeds the rapid-upload proof offset (usually the access token).
    /// The source is owned for the whole call and any spool file it created
    /// is removed when it drops, on every path.
    pub async fn put(
        &self,
        path: &str,
        mut source: UploadSource,
        secret: &str,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> TransferResult<PutOutcome> {
        let size = source.size();
        let plan = plan(size, &self.config.plan_constraints())?;
        tracing::debug!(
            "put {}: {} bytes in {} parts of {}",
            path,
            size,
            plan.len(),
            plan.chunk_size
        );

        let negotiator = HashNegotiator::new(
            self.negotiation.clone(),
            NegotiatorOptions::from(&self.config),
        );
        let (session, proof) = match negotiator
            .negotiate(&mut source, &plan, path, secret, cancel)
            .await?
        {
            Negotiation::Completed { remote_id } => {
                if let Some(cb) = &progress {
                    cb(size, size);
                }
                return Ok(PutOutcome {
                    remote_id,
                    rapid: true,
                    uploaded_bytes: 0,
                });
            }
            Negotiation::NeedsUpload { session, proof } => (session, proof),
        };

        let mut full_hash = proof.and_then(|p| p.full_hash);
        if full_hash.is_none() && self.config.full_hash_on_upload {
            full_hash = Some(
                source
                    .full_hash(HashAlgorithm::Sha1, self.config.temp_dir.as_deref(), cancel)
                    .await?,
            );
        }

        source.rewind().await?;
        let coordinator = UploadCoordinator::new(
            self.negotiation.clone(),
            self.parts.clone(),
            UploadOptions::from(&self.config),
        );
        // Zero-byte files have no parts but still go through commit / 空文件也要提交
        let uploaded = coordinator
            .upload(&mut source, &plan, session, progress.clone(), cancel)
            .await?;
        if plan.is_empty() {
            if let Some(cb) = &progress {
                cb(0, 0);
            }
        }

        let full_hash = full_hash.map(|h| (HashAlgorithm::Sha1, h));
        let remote_id = coordinator.commit(&uploaded, full_hash).await?;
        Ok(PutOutcome {
            remote_id,
            rapid: false,
            uploaded_bytes: uploaded.uploaded_bytes,
        })
    }
}
