//! Upload session descriptor / 上传会话
//!
//! A session is immutable once issued. Renewal and lazy target fetching build
//! a new session and swap it in whole; workers holding the old `Arc` keep a
//! consistent view.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::transport::{NegotiationTransport, PartSpec};
use crate::error::{TransferError, TransferResult};

/// Where and how to PUT one part / 分片上传目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTarget {
    pub part_number: u32,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_id: Option<String>,
    targets: BTreeMap<u32, PartTarget>,
    pub issued_at: Instant,
    pub expiry: Option<Instant>,
    /// Server-declared target lifetime, reapplied on renewal / 上传地址有效期
    lifetime: Option<Duration>,
    /// Bumped on every full renewal / 每次整体刷新递增
    pub generation: u64,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        file_id: Option<String>,
        targets: Vec<PartTarget>,
        expires_in: Option<Duration>,
    ) -> Self {
        let issued_at = Instant::now();
        Self {
            upload_id: upload_id.into(),
            file_id,
            targets: targets.into_iter().map(|t| (t.part_number, t)).collect(),
            issued_at,
            expiry: expires_in.map(|d| issued_at + d),
            lifetime: expires_in,
            generation: 0,
        }
    }

    pub fn target(&self, part_number: u32) -> Option<&PartTarget> {
        self.targets.get(&part_number)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn merged(&self, fresh: Vec<PartTarget>) -> BTreeMap<u32, PartTarget> {
        let mut targets = self.targets.clone();
        for t in fresh {
            targets.insert(t.part_number, t);
        }
        targets
    }

    /// Copy of this session with `fresh` targets replacing same-numbered
    /// ones. Issue time, expiry and generation carry over: fetching or
    /// replacing single targets does not restart the session clock.
    /// 替换部分上传地址
    pub fn with_targets(&self, fresh: Vec<PartTarget>) -> Self {
        Self {
            upload_id: self.upload_id.clone(),
            file_id: self.file_id.clone(),
            targets: self.merged(fresh),
            issued_at: self.issued_at,
            expiry: self.expiry,
            lifetime: self.lifetime,
            generation: self.generation,
        }
    }

    /// Full renewal: fresh targets and a restarted clock. Without a new
    /// lifetime from the server the original one is applied again.
    /// 整体刷新会话
    pub fn renewed(&self, fresh: Vec<PartTarget>, expires_in: Option<Duration>) -> Self {
        let issued_at = Instant::now();
        let lifetime = expires_in.or(self.lifetime);
        Self {
            upload_id: self.upload_id.clone(),
            file_id: self.file_id.clone(),
            targets: self.merged(fresh),
            issued_at,
            expiry: lifetime.map(|d| issued_at + d),
            lifetime,
            generation: self.generation + 1,
        }
    }

    /// Issued longer than `window` ago, or past the server expiry / 是否需要刷新
    pub fn is_stale(&self, window: Duration) -> bool {
        if self.issued_at.elapsed() >= window {
            return true;
        }
        matches!(self.expiry, Some(at) if Instant::now() >= at)
    }
}

/// Holder that swaps sessions atomically between workers / 会话容器
pub struct SessionCell {
    current: RwLock<Arc<UploadSession>>,
    renew_lock: tokio::sync::Mutex<()>,
}

impl SessionCell {
    pub fn new(session: UploadSession) -> Self {
        Self {
            current: RwLock::new(Arc::new(session)),
            renew_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<UploadSession> {
        self.current.read().clone()
    }

    fn install(&self, session: UploadSession) -> Arc<UploadSession> {
        let session = Arc::new(session);
        *self.current.write() = session.clone();
        session
    }

    /// Renew targets for `parts` if the session is still stale once the
    /// renewal lock is held; a worker that lost the race reuses the winner's
    /// session / 会话过期时整体刷新
    pub async fn renew_stale(
        &self,
        window: Duration,
        transport: &dyn NegotiationTransport,
        parts: &[PartSpec],
    ) -> TransferResult<Arc<UploadSession>> {
        let _guard = self.renew_lock.lock().await;
        let current = self.current();
        if !current.is_stale(window) {
            return Ok(current);
        }

        tracing::warn!(
            "renewing {} part targets for upload {}",
            parts.len(),
            current.upload_id
        );
        let fresh = transport.refresh_targets(&current.upload_id, parts).await?;
        Ok(self.install(current.renewed(fresh, None)))
    }

    /// Replace the target the server rejected for `part`. Nothing is fetched
    /// when the current target already differs from `rejected`.
    /// 替换被拒绝的上传地址
    pub async fn replace_rejected(
        &self,
        rejected: &PartTarget,
        transport: &dyn NegotiationTransport,
        part: &PartSpec,
    ) -> TransferResult<Arc<UploadSession>> {
        let _guard = self.renew_lock.lock().await;
        let current = self.current();
        let still_rejected = current
            .target(part.part_number)
            .map_or(true, |t| t.url == rejected.url);
        if !still_rejected {
            return Ok(current);
        }

        tracing::warn!(
            "replacing rejected target of part {} for upload {}",
            part.part_number,
            current.upload_id
        );
        let fresh = transport
            .refresh_targets(&current.upload_id, std::slice::from_ref(part))
            .await?;
        Ok(self.install(current.with_targets(fresh)))
    }

    /// Target for `part`, fetching it lazily when the session has none
    /// 获取分片上传地址（按需拉取）
    pub async fn ensure_target(
        &self,
        part: &PartSpec,
        transport: &dyn NegotiationTransport,
    ) -> TransferResult<(Arc<UploadSession>, PartTarget)> {
        let session = self.current();
        if let Some(target) = session.target(part.part_number) {
            return Ok((session.clone(), target.clone()));
        }

        let _guard = self.renew_lock.lock().await;
        let session = self.current();
        if let Some(target) = session.target(part.part_number) {
            return Ok((session.clone(), target.clone()));
        }

        let fresh = transport
            .refresh_targets(&session.upload_id, std::slice::from_ref(part))
            .await?;
        let session = self.install(session.with_targets(fresh));
        let target = session.target(part.part_number).cloned().ok_or_else(|| {
            TransferError::protocol(
                "server returned no target for requested part",
                format!("part_number={}", part.part_number),
            )
        })?;
        Ok((session, target))
    }
}
