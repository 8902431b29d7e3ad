use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{keys, Store};

/// A time-bounded lease on one job.
///
/// Field tags are fixed: owner=4, acquired_at=8, eta=16. `generation` is a
/// fencing token bumped on every fresh acquisition and kept on renewal.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Lock {
    #[prost(string, tag = "4")]
    pub owner: String,
    #[prost(int64, tag = "8")]
    pub acquired_at: i64,
    #[prost(int64, tag = "16")]
    pub eta: i64,
    #[prost(uint64, tag = "17")]
    pub generation: u64,
}

impl Lock {
    pub fn expires_at(&self) -> i64 {
        self.acquired_at.saturating_add(self.eta)
    }

    /// The lease window is `[acquired_at, acquired_at + eta)`.
    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.expires_at()
    }
}

/// Result of looking at a job's lock record at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock record exists.
    Absent,
    /// A record exists but its window has elapsed.
    Expired(Lock),
    Held(Lock),
}

impl LockState {
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Held(_))
    }

    pub fn record(&self) -> Option<&Lock> {
        match self {
            LockState::Absent => None,
            LockState::Expired(lock) | LockState::Held(lock) => Some(lock),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(Lock),
    Renewed(Lock),
    Rejected { owner: String, till: i64 },
}

/// Reads and writes lock records under `/locked/jobs/`.
///
/// The ledger has no opinion about job status. The store offers no
/// compare-and-swap, so two acquisitions racing on an expired record can
/// both write. The later writer wins and the loser's reports fail the
/// ownership check; a holder whose lease lapsed and was taken over is
/// caught by the generation instead.
#[derive(Clone)]
pub struct LockLedger {
    store: Arc<dyn Store>,
}

impl LockLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Loads the lock record. A record that fails to decode is treated as
    /// absent so the next acquisition overwrites it.
    pub async fn read(&self, jid: &str) -> Result<Option<Lock>> {
        let Some(bytes) = self.store.get(&keys::lock(jid)).await? else {
            return Ok(None);
        };
        match <Lock as prost::Message>::decode(bytes.as_slice()) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) => {
                warn!(jid = %jid, error = %e, "Discarding undecodable lock record");
                Ok(None)
            }
        }
    }

    pub async fn inspect(&self, jid: &str, now: i64) -> Result<LockState> {
        Ok(match self.read(jid).await? {
            None => LockState::Absent,
            Some(lock) if lock.is_valid_at(now) => LockState::Held(lock),
            Some(lock) => LockState::Expired(lock),
        })
    }

    /// Unconditionally writes a lock record.
    pub async fn try_acquire(
        &self,
        jid: &str,
        owner: &str,
        now: i64,
        eta: i64,
        generation: u64,
    ) -> Result<Lock> {
        let lock = Lock {
            owner: owner.to_string(),
            acquired_at: now,
            eta,
            generation,
        };
        self.write(jid, &lock).await?;
        Ok(lock)
    }

    /// Applies the acquisition policy: free or expired records are taken
    /// with a new generation, the current holder renews, anyone else is
    /// rejected with the holder's identity and expiry.
    pub async fn acquire(&self, jid: &str, owner: &str, now: i64, eta: i64) -> Result<LockOutcome> {
        match self.inspect(jid, now).await? {
            LockState::Held(current) if current.owner == owner => {
                let lock = self
                    .try_acquire(jid, owner, now, eta, current.generation)
                    .await?;
                debug!(jid = %jid, owner = %owner, "Lease renewed");
                Ok(LockOutcome::Renewed(lock))
            }
            LockState::Held(current) => Ok(LockOutcome::Rejected {
                till: current.expires_at(),
                owner: current.owner,
            }),
            state => {
                let generation = state.record().map_or(0, |l| l.generation) + 1;
                let lock = self.try_acquire(jid, owner, now, eta, generation).await?;
                debug!(jid = %jid, owner = %owner, generation, "Lease acquired");
                Ok(LockOutcome::Acquired(lock))
            }
        }
    }

    /// Collapses the window to zero while keeping owner and generation, so
    /// the record stays inspectable but no longer blocks anyone.
    pub async fn expire(&self, jid: &str, mut lock: Lock, now: i64) -> Result<Lock> {
        lock.acquired_at = now;
        lock.eta = 0;
        self.write(jid, &lock).await?;
        Ok(lock)
    }

    pub async fn release(&self, jid: &str) -> Result<()> {
        self.store.delete(&keys::lock(jid)).await?;
        Ok(())
    }

    async fn write(&self, jid: &str, lock: &Lock) -> Result<()> {
        self.store
            .put(&keys::lock(jid), prost::Message::encode_to_vec(lock))
            .await?;
        Ok(())
    }
}
