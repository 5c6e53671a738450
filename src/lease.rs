//! Atomic run claims for the duplicate-run guard.
//!
//! A claim is a small JSON object at `locks/{job}.lease`, created with a
//! conditional put. An expired lease is taken over by a conditional put that
//! must match its ETag, so at most one claimant wins either way.

use crate::error::Result;
use crate::storage::{ObjectLocation, ObjectStore, PutCondition};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LEASE_PREFIX: &str = "locks";

/// Mutual exclusion across dispatcher invocations for one job
#[async_trait]
pub trait RunLease: Send + Sync {
    /// Claim the job for `holder`. `Ok(false)` when someone else holds it.
    async fn try_claim(&self, job_name: &str, holder: &str) -> Result<bool>;

    /// Hand a held claim from `from` to `to` (e.g. to the started run id)
    async fn transfer(&self, job_name: &str, from: &str, to: &str) -> Result<bool>;

    /// Release the claim if `holder` owns it; `None` releases unconditionally
    async fn release(&self, job_name: &str, holder: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub job_name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lease kept in an [`ObjectStore`] bucket
pub struct ObjectStoreLease {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    ttl: Duration,
}

impl ObjectStoreLease {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, ttl_secs: u64) -> Self {
        let ttl_secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000);
        Self {
            store,
            bucket: bucket.to_string(),
            ttl: Duration::try_seconds(ttl_secs).unwrap_or(Duration::MAX),
        }
    }

    fn location(&self, job_name: &str) -> ObjectLocation {
        let safe: String = job_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        ObjectLocation::new(self.bucket.clone(), format!("{}/{}.lease", LEASE_PREFIX, safe))
    }

    fn record(&self, job_name: &str, holder: &str) -> Result<Bytes> {
        let now = Utc::now();
        let record = LeaseRecord {
            job_name: job_name.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        Ok(Bytes::from(serde_json::to_vec(&record)?))
    }

    /// Current lease, if any. Unreadable contents count as expired.
    async fn current(
        &self,
        location: &ObjectLocation,
    ) -> Result<Option<(Option<LeaseRecord>, String)>> {
        let Some(object) = self.store.get_versioned(location).await? else {
            return Ok(None);
        };
        let record = match serde_json::from_slice::<LeaseRecord>(&object.data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Unreadable lease at {}: {}", location, e);
                None
            }
        };
        Ok(Some((record, object.etag)))
    }
}

#[async_trait]
impl RunLease for ObjectStoreLease {
    async fn try_claim(&self, job_name: &str, holder: &str) -> Result<bool> {
        let location = self.location(job_name);
        let data = self.record(job_name, holder)?;

        let condition = match self.current(&location).await? {
            None => PutCondition::Absent,
            Some((Some(existing), _)) if !existing.is_expired(Utc::now()) => {
                info!(
                    "Job '{}' is claimed by {} until {}",
                    job_name, existing.holder, existing.expires_at
                );
                return Ok(false);
            }
            Some((existing, etag)) => {
                if let Some(existing) = existing {
                    warn!(
                        "Taking over expired lease for '{}' held by {} (expired {})",
                        job_name, existing.holder, existing.expires_at
                    );
                }
                PutCondition::Matches(etag)
            }
        };

        let won = self.store.put_conditional(&location, data, condition).await?;
        if won {
            debug!("Claimed '{}' for {}", job_name, holder);
        } else {
            info!("Lost the race to claim '{}'", job_name);
        }
        Ok(won)
    }

    async fn transfer(&self, job_name: &str, from: &str, to: &str) -> Result<bool> {
        let location = self.location(job_name);
        match self.current(&location).await? {
            Some((Some(existing), etag)) if existing.holder == from => {
                let data = self.record(job_name, to)?;
                self.store
                    .put_conditional(&location, data, PutCondition::Matches(etag))
                    .await
            }
            _ => {
                warn!("Cannot transfer lease for '{}': not held by {}", job_name, from);
                Ok(false)
            }
        }
    }

    async fn release(&self, job_name: &str, holder: Option<&str>) -> Result<()> {
        let location = self.location(job_name);
        let Some((record, _)) = self.current(&location).await? else {
            debug!("No lease to release for '{}'", job_name);
            return Ok(());
        };

        if let (Some(expected), Some(record)) = (holder, record.as_ref()) {
            if record.holder != expected {
                info!(
                    "Leaving lease for '{}' in place: held by {}, not {}",
                    job_name, record.holder, expected
                );
                return Ok(());
            }
        }

        self.store.delete(&location).await?;
        info!("Released lease for '{}'", job_name);
        Ok(())
    }
}
