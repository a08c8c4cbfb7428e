//! Shared job ledger.
//!
//! Every worker consults the ledger before doing work for a delivery, which
//! turns the at-least-once channel into at-most-once transcodes per job id.
//! Entries are JSON values in an [`IdempotencyStore`]; every transition is a
//! compare-and-swap against the value that was read, so two workers racing
//! on the same job never both win.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vingest_models::JobId;
use vingest_queue::IdempotencyStore;

use crate::error::{WorkerError, WorkerResult};

/// Bound on read-modify-write rounds before giving up under contention.
const MAX_CAS_ROUNDS: usize = 16;

/// State of one job in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerEntry {
    InFlight {
        owner: String,
        lease_expires_at: DateTime<Utc>,
        attempts: u32,
    },
    /// Claim given up after a retryable failure; any worker may take over.
    Released { attempts: u32, last_error: String },
    Completed {
        outputs: Vec<String>,
        completed_at: DateTime<Utc>,
        attempts: u32,
    },
    DeadLettered { reason: String, attempts: u32 },
}

impl LedgerEntry {
    pub fn attempts(&self) -> u32 {
        match self {
            LedgerEntry::InFlight { attempts, .. }
            | LedgerEntry::Released { attempts, .. }
            | LedgerEntry::Completed { attempts, .. }
            | LedgerEntry::DeadLettered { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerEntry::Completed { .. } | LedgerEntry::DeadLettered { .. }
        )
    }
}

/// Result of trying to claim a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker owns the job; `attempt` is 1-based across all workers.
    Acquired { attempt: u32 },
    AlreadyCompleted { outputs: Vec<String> },
    /// Another worker holds an unexpired lease.
    HeldElsewhere { owner: String },
    DeadLettered { reason: String },
}

/// Job ledger over an idempotency store.
pub struct JobLedger {
    store: Arc<dyn IdempotencyStore>,
    lease: Duration,
    ttl: Duration,
}

impl JobLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, lease: Duration, ttl: Duration) -> Self {
        Self { store, lease, ttl }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    fn key(job_id: &JobId) -> String {
        format!("ledger:{}", job_id)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn encode(entry: &LedgerEntry) -> WorkerResult<String> {
        serde_json::to_string(entry).map_err(|e| WorkerError::ledger(e.to_string()))
    }

    fn decode(job_id: &JobId, raw: &str) -> WorkerResult<LedgerEntry> {
        serde_json::from_str(raw)
            .map_err(|e| WorkerError::ledger(format!("corrupt entry for {}: {}", job_id, e)))
    }

    /// Current entry, if any.
    pub async fn get(&self, job_id: &JobId) -> WorkerResult<Option<LedgerEntry>> {
        match self.store.get(&Self::key(job_id)).await? {
            Some(raw) => Ok(Some(Self::decode(job_id, &raw)?)),
            None => Ok(None),
        }
    }

    /// Claim `job_id` for `owner`.
    ///
    /// A missing entry, an expired lease, a released claim or the caller's
    /// own stale claim is taken over; the attempt counter carries across
    /// owners.
    pub async fn claim(
        &self,
        job_id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> WorkerResult<ClaimOutcome> {
        let key = Self::key(job_id);

        for _ in 0..MAX_CAS_ROUNDS {
            let fresh = LedgerEntry::InFlight {
                owner: owner.to_string(),
                lease_expires_at: self.lease_until(now),
                attempts: 1,
            };
            if self
                .store
                .insert_if_absent(&key, &Self::encode(&fresh)?, self.ttl)
                .await?
            {
                debug!(job_id = %job_id, owner, "Claimed new job");
                return Ok(ClaimOutcome::Acquired { attempt: 1 });
            }

            // expired between insert and read
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };

            let attempt = match Self::decode(job_id, &raw)? {
                LedgerEntry::Completed { outputs, .. } => {
                    return Ok(ClaimOutcome::AlreadyCompleted { outputs });
                }
                LedgerEntry::DeadLettered { reason, .. } => {
                    return Ok(ClaimOutcome::DeadLettered { reason });
                }
                LedgerEntry::InFlight {
                    owner: holder,
                    lease_expires_at,
                    ..
                } if holder != owner && lease_expires_at > now => {
                    return Ok(ClaimOutcome::HeldElsewhere { owner: holder });
                }
                LedgerEntry::InFlight {
                    owner: holder,
                    attempts,
                    ..
                } => {
                    if holder != owner {
                        info!(job_id = %job_id, previous = %holder, owner, "Taking over expired lease");
                    }
                    attempts + 1
                }
                LedgerEntry::Released { attempts, .. } => attempts + 1,
            };

            let next = LedgerEntry::InFlight {
                owner: owner.to_string(),
                lease_expires_at: self.lease_until(now),
                attempts: attempt,
            };
            if self
                .store
                .compare_and_swap(&key, &raw, &Self::encode(&next)?, self.ttl)
                .await?
            {
                return Ok(ClaimOutcome::Acquired { attempt });
            }
            debug!(job_id = %job_id, owner, "Lost claim race, re-reading");
        }

        Err(WorkerError::ledger(format!(
            "claim for {} did not settle after {} rounds",
            job_id, MAX_CAS_ROUNDS
        )))
    }

    /// Apply `f` to the current entry with compare-and-swap until it sticks.
    ///
    /// `f` returning `None` leaves the entry untouched. Returns the entry
    /// that was written.
    async fn update<F>(&self, job_id: &JobId, f: F) -> WorkerResult<Option<LedgerEntry>>
    where
        F: Fn(Option<&LedgerEntry>) -> Option<LedgerEntry> + Send + Sync,
    {
        let key = Self::key(job_id);

        for _ in 0..MAX_CAS_ROUNDS {
            let raw = self.store.get(&key).await?;
            let current = raw
                .as_deref()
                .map(|r| Self::decode(job_id, r))
                .transpose()?;
            let Some(next) = f(current.as_ref()) else {
                return Ok(None);
            };
            let encoded = Self::encode(&next)?;

            let written = match &raw {
                Some(expected) => {
                    self.store
                        .compare_and_swap(&key, expected, &encoded, self.ttl)
                        .await?
                }
                None => self.store.insert_if_absent(&key, &encoded, self.ttl).await?,
            };
            if written {
                return Ok(Some(next));
            }
        }

        Err(WorkerError::ledger(format!(
            "update for {} did not settle after {} rounds",
            job_id, MAX_CAS_ROUNDS
        )))
    }

    /// Extend the lease held by `owner`. Returns false when the claim was lost.
    pub async fn renew(&self, job_id: &JobId, owner: &str, now: DateTime<Utc>) -> WorkerResult<bool> {
        let lease_expires_at = self.lease_until(now);
        let renewed = self
            .update(job_id, |current| match current {
                Some(LedgerEntry::InFlight {
                    owner: holder,
                    attempts,
                    ..
                }) if holder == owner => Some(LedgerEntry::InFlight {
                    owner: owner.to_string(),
                    lease_expires_at,
                    attempts: *attempts,
                }),
                _ => None,
            })
            .await?;
        if renewed.is_none() {
            warn!(job_id = %job_id, owner, "Lease renewal rejected, claim lost");
        }
        Ok(renewed.is_some())
    }

    /// Record the outputs of a finished transcode.
    ///
    /// Completion wins over any non-terminal state, including a takeover by
    /// another worker, since the outputs are already written.
    pub async fn complete(
        &self,
        job_id: &JobId,
        outputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> WorkerResult<()> {
        self.update(job_id, |current| match current {
            Some(entry) if entry.is_terminal() => None,
            other => Some(LedgerEntry::Completed {
                outputs: outputs.clone(),
                completed_at: now,
                attempts: other.map_or(1, LedgerEntry::attempts),
            }),
        })
        .await?;
        Ok(())
    }

    /// Give up the claim after a retryable failure.
    pub async fn release(&self, job_id: &JobId, owner: &str, error: &str) -> WorkerResult<()> {
        self.update(job_id, |current| match current {
            Some(LedgerEntry::InFlight {
                owner: holder,
                attempts,
                ..
            }) if holder == owner => Some(LedgerEntry::Released {
                attempts: *attempts,
                last_error: error.to_string(),
            }),
            _ => None,
        })
        .await?;
        Ok(())
    }

    /// Mark the job as dead-lettered. A completed job stays completed.
    pub async fn dead_letter(&self, job_id: &JobId, reason: &str) -> WorkerResult<()> {
        self.update(job_id, |current| match current {
            Some(LedgerEntry::Completed { .. }) => None,
            other => Some(LedgerEntry::DeadLettered {
                reason: reason.to_string(),
                attempts: other.map_or(0, LedgerEntry::attempts),
            }),
        })
        .await?;
        Ok(())
    }
}
