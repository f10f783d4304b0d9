//! Job Lock Manager - distributed mutex keyed by job name.
//!
//! TTL-based rather than heartbeat-renewed: settlement sweeps are bounded
//! batch operations, so the TTL is sized past the worst-case sweep with
//! margin. TTL alone cannot tell "slow but alive" from "crashed", which is
//! why `force_release` exists as an audited operator escape hatch.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppResult, LockError};
use crate::ledger::models::{AuditEventType, AuditLog, JobLock};
use crate::store::SettlementStore;

pub struct JobLockManager {
    store: Arc<dyn SettlementStore>,
}

impl JobLockManager {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Acquire the named lock. An expired lock for the same name is
    /// superseded atomically; a live one fails with `AlreadyLocked`.
    pub async fn acquire(
        &self,
        job_name: &str,
        owner: &str,
        ttl: Duration,
        booking_ids: Vec<Uuid>,
    ) -> AppResult<JobLock> {
        let now = Utc::now();
        let lock = JobLock {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            locked_at: now,
            locked_by: owner.to_string(),
            expires_at: now + ttl,
            booking_ids,
        };

        if self.store.try_acquire_lock(&lock).await? {
            info!(job_name, owner, expires_at = %lock.expires_at, "Job lock acquired");
            return Ok(lock);
        }

        let holder = self.store.lock_by_name(job_name).await?;
        let (locked_by, expires_at) = holder
            .map(|l| (l.locked_by, l.expires_at))
            .unwrap_or_else(|| ("unknown".to_string(), now));
        Err(LockError::AlreadyLocked {
            job_name: job_name.to_string(),
            locked_by,
            expires_at,
        }
        .into())
    }

    /// Release the named lock if `owner` holds it. Releasing a lock that no
    /// longer exists is fine: TTL expiry plus supersession already freed it.
    pub async fn release(&self, job_name: &str, owner: &str) -> AppResult<()> {
        let deleted = self.store.delete_lock_by_name(job_name, owner).await?;
        if deleted > 0 {
            info!(job_name, owner, "Job lock released");
            return Ok(());
        }

        match self.store.lock_by_name(job_name).await? {
            Some(_) => Err(LockError::NotOwner {
                job_name: job_name.to_string(),
            }
            .into()),
            None => {
                warn!(job_name, owner, "Release found no lock row; TTL expiry already superseded it");
                Ok(())
            }
        }
    }

    /// Administrative override for crash recovery: deletes the lock regardless
    /// of ownership or expiry and audits who forced it and whether it was
    /// still live at the time.
    pub async fn force_release(&self, lock_id: Uuid, actor: &str) -> AppResult<JobLock> {
        let lock = self
            .store
            .lock_by_id(lock_id)
            .await?
            .ok_or(LockError::NotFound(lock_id))?;
        let was_live = !lock.is_expired(Utc::now());

        self.store.delete_lock_by_id(lock_id).await?;
        self.store
            .insert_audit(&AuditLog::new(
                AuditEventType::LockForceReleased,
                Some(lock_id),
                Some(actor.to_string()),
                json!({
                    "job_name": lock.job_name,
                    "locked_by": lock.locked_by,
                    "expires_at": lock.expires_at,
                    "was_live": was_live,
                }),
            ))
            .await?;

        warn!(job_name = %lock.job_name, actor, was_live, "Job lock force-released");
        Ok(lock)
    }

    pub async fn active_locks(&self) -> AppResult<Vec<JobLock>> {
        self.store.active_locks(Utc::now()).await
    }

    pub async fn active_lock_count(&self) -> AppResult<usize> {
        Ok(self.active_locks().await?.len())
    }
}
