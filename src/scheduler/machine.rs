use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{PatrickError, Result};
use crate::scheduler::clock::Clock;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::lock::{Lock, LockLedger, LockOutcome, LockState};
use crate::store::{keys, Store, StoreStats};

pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 2;

/// Who is asking for a mutation.
///
/// Only a peer is subject to lease ownership checks. `Operator` is never
/// constructed from the P2P surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Peer(String),
    Operator,
}

impl Caller {
    pub fn peer(id: impl Into<String>) -> Self {
        Caller::Peer(id.into())
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Peer(id) => write!(f, "{}", id),
            Caller::Operator => write!(f, "operator"),
        }
    }
}

/// What a worker reports along with `done` or `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub logs: BTreeMap<String, String>,
    pub asset_cid: BTreeMap<String, String>,
    /// Lease generation the worker holds, if it tracks one.
    pub generation: Option<u64>,
}

/// Where a job record was found. The archive wins when both exist.
#[derive(Debug, Clone, PartialEq)]
pub enum Located {
    Active(Job),
    Archived(Job),
}

impl Located {
    pub fn job(&self) -> &Job {
        match self {
            Located::Active(job) | Located::Archived(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Located::Active(job) | Located::Archived(job) => job,
        }
    }

    pub fn is_archived(&self) -> bool {
        matches!(self, Located::Archived(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job reached a terminal status and moved to the archive range.
    Archived(Job),
    /// The job went back to `Open` and was announced again.
    Requeued(Job),
    /// The job was already archived; nothing changed.
    AlreadyArchived,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Reopened(Job),
    /// The job is still `Open` or `Locked`; retry does nothing.
    AlreadyActive(Job),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lock: Lock,
    pub renewed: bool,
}

/// Every job mutation goes through here.
///
/// The state machine keeps no job state of its own; each operation reads
/// the records it needs from the store, checks them, and writes back.
pub struct JobStateMachine {
    store: Arc<dyn Store>,
    ledger: LockLedger,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl JobStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger: LockLedger::new(store.clone()),
            store,
            dispatcher,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn ledger(&self) -> &LockLedger {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }

    async fn load(&self, key: &str) -> Result<Option<Job>> {
        match self.store.get(key).await? {
            Some(bytes) => Job::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the active range only.
    pub async fn active(&self, jid: &str) -> Result<Option<Job>> {
        self.load(&keys::active(jid)).await
    }

    pub async fn find(&self, jid: &str) -> Result<Option<Located>> {
        if let Some(job) = self.load(&keys::archive(jid)).await? {
            return Ok(Some(Located::Archived(job)));
        }
        Ok(self.active(jid).await?.map(Located::Active))
    }

    /// Ids from both the active and archive ranges, de-duplicated.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();
        for prefix in [keys::ACTIVE_PREFIX, keys::ARCHIVE_PREFIX] {
            let listed = self.store.list(prefix).await?;
            ids.extend(keys::ids_under(prefix, listed));
        }
        Ok(ids.into_iter().collect())
    }

    pub async fn list_active(&self) -> Result<Vec<String>> {
        let listed = self.store.list(keys::ACTIVE_PREFIX).await?;
        Ok(keys::ids_under(keys::ACTIVE_PREFIX, listed))
    }

    pub async fn list_project(&self, project_id: &str) -> Result<Vec<String>> {
        let prefix = keys::project_prefix(project_id);
        let listed = self.store.list(&prefix).await?;
        Ok(keys::ids_under(&prefix, listed))
    }

    pub async fn info(&self, jid: &str) -> Result<Job> {
        self.find(jid)
            .await?
            .map(Located::into_job)
            .ok_or_else(|| PatrickError::JobNotFound(jid.to_string()))
    }

    /// Stores a freshly ingested job, indexes it under its project, and
    /// announces it.
    pub async fn register(&self, job: &Job, project_id: &str) -> Result<()> {
        self.store
            .put(&keys::active(&job.id), job.to_bytes())
            .await?;
        self.store
            .put(&keys::project_entry(project_id, &job.id), Vec::new())
            .await?;
        info!(job_id = %job.id, project = %project_id, "Job registered");
        self.dispatcher.announce(job).await
    }

    pub async fn lock(&self, jid: &str, owner: &str, eta: i64) -> Result<LeaseGrant> {
        if owner.is_empty() {
            return Err(PatrickError::InvalidArgument(
                "lock requires a peer id".to_string(),
            ));
        }
        if eta <= 0 {
            return Err(PatrickError::InvalidArgument(format!(
                "eta must be positive, got {}",
                eta
            )));
        }

        let mut job = match self.find(jid).await? {
            Some(Located::Active(job)) => job,
            Some(Located::Archived(_)) => {
                return Err(PatrickError::AlreadyFinished(jid.to_string()))
            }
            None => return Err(PatrickError::JobNotFound(jid.to_string())),
        };

        let now = self.now();
        let grant = match self.ledger.acquire(jid, owner, now, eta).await? {
            LockOutcome::Acquired(lock) => LeaseGrant {
                lock,
                renewed: false,
            },
            LockOutcome::Renewed(lock) => LeaseGrant {
                lock,
                renewed: true,
            },
            LockOutcome::Rejected { owner: holder, till } => {
                debug!(job_id = %jid, peer = %owner, holder = %holder, till, "Lock rejected");
                return Err(PatrickError::Locked {
                    jid: jid.to_string(),
                    owner: holder,
                    till,
                });
            }
        };

        if job.status() == JobStatus::Open {
            job.set_status(JobStatus::Locked);
            self.store.put(&keys::active(jid), job.to_bytes()).await?;
        }

        info!(
            job_id = %jid,
            peer = %owner,
            till = grant.lock.expires_at(),
            generation = grant.lock.generation,
            renewed = grant.renewed,
            "Job locked"
        );
        Ok(grant)
    }

    pub async fn is_locked(&self, jid: &str) -> Result<LockState> {
        self.ledger.inspect(jid, self.now()).await
    }

    /// Collapses the lease window. The record and its owner stay so the
    /// generation keeps counting.
    pub async fn unlock(&self, jid: &str, caller: &Caller) -> Result<Lock> {
        let now = self.now();
        let lock = self
            .ledger
            .read(jid)
            .await?
            .ok_or_else(|| PatrickError::LockNotFound(jid.to_string()))?;

        if let Caller::Peer(peer) = caller {
            if lock.is_valid_at(now) && lock.owner != *peer {
                return Err(PatrickError::NotOwner {
                    jid: jid.to_string(),
                    caller: peer.clone(),
                    owner: lock.owner,
                });
            }
        }

        let lock = self.ledger.expire(jid, lock, now).await?;
        info!(job_id = %jid, caller = %caller, "Job unlocked");
        Ok(lock)
    }

    pub async fn done(&self, jid: &str, caller: &Caller, report: Report) -> Result<Transition> {
        let Some(mut job) = self.active_for_update(jid).await? else {
            return Ok(Transition::AlreadyArchived);
        };
        require_locked(&job, caller)?;
        self.authorize(jid, caller, report.generation).await?;

        job.set_status(JobStatus::Success);
        job.attempt = self.bump(job.attempt);
        job.logs = report.logs;
        job.asset_cid = report.asset_cid;
        self.archive(&job).await?;
        Ok(Transition::Archived(job))
    }

    pub async fn failed(&self, jid: &str, caller: &Caller, report: Report) -> Result<Transition> {
        let Some(mut job) = self.active_for_update(jid).await? else {
            return Ok(Transition::AlreadyArchived);
        };
        require_locked(&job, caller)?;
        self.authorize(jid, caller, report.generation).await?;

        job.logs = report.logs;
        job.asset_cid = report.asset_cid;
        self.spend_attempt(job).await
    }

    /// A worker gave up on its lease. Same attempt accounting as `failed`.
    pub async fn timeout(
        &self,
        jid: &str,
        caller: &Caller,
        logs: BTreeMap<String, String>,
    ) -> Result<Transition> {
        let Some(mut job) = self.active_for_update(jid).await? else {
            return Ok(Transition::AlreadyArchived);
        };
        self.authorize(jid, caller, None).await?;

        if !logs.is_empty() {
            job.logs = logs;
        }
        self.spend_attempt(job).await
    }

    pub async fn cancel(
        &self,
        jid: &str,
        caller: &Caller,
        logs: BTreeMap<String, String>,
    ) -> Result<Transition> {
        let Some(mut job) = self.active_for_update(jid).await? else {
            return Ok(Transition::AlreadyArchived);
        };
        self.authorize(jid, caller, None).await?;

        job.set_status(JobStatus::Cancelled);
        if !logs.is_empty() {
            job.logs = logs;
        }
        self.archive(&job).await?;
        Ok(Transition::Archived(job))
    }

    /// Moves an archived job back to `Open` and announces it. The attempt
    /// counter is left as it was.
    pub async fn retry(&self, jid: &str) -> Result<RetryOutcome> {
        let mut job = match self.find(jid).await? {
            Some(Located::Archived(job)) => job,
            Some(Located::Active(job)) => {
                debug!(job_id = %jid, status = %job.status(), "Retry ignored, job still active");
                return Ok(RetryOutcome::AlreadyActive(job));
            }
            None => return Err(PatrickError::JobNotFound(jid.to_string())),
        };

        job.set_status(JobStatus::Open);
        job.timestamp = self.now();
        self.store.put(&keys::active(jid), job.to_bytes()).await?;
        self.store.delete(&keys::archive(jid)).await?;
        self.ledger.release(jid).await?;
        info!(job_id = %jid, attempt = job.attempt, "Job reopened");

        self.dispatcher.announce(&job).await?;
        Ok(RetryOutcome::Reopened(job))
    }

    /// Deletes active and lock copies left behind by an interrupted
    /// archive. Returns whether the job is archived.
    pub async fn reconcile(&self, jid: &str) -> Result<bool> {
        if self.store.get(&keys::archive(jid)).await?.is_none() {
            return Ok(false);
        }
        self.drop_stale_copies(jid).await?;
        Ok(true)
    }

    async fn active_for_update(&self, jid: &str) -> Result<Option<Job>> {
        match self.find(jid).await? {
            Some(Located::Active(job)) => Ok(Some(job)),
            Some(Located::Archived(_)) => {
                debug!(job_id = %jid, "Job already archived");
                self.drop_stale_copies(jid).await?;
                Ok(None)
            }
            None => Err(PatrickError::JobNotFound(jid.to_string())),
        }
    }

    async fn drop_stale_copies(&self, jid: &str) -> Result<()> {
        self.store.delete(&keys::active(jid)).await?;
        self.ledger.release(jid).await
    }

    /// Peers must hold the current generation, if they present one, and
    /// must own the lease while it is valid.
    async fn authorize(&self, jid: &str, caller: &Caller, generation: Option<u64>) -> Result<()> {
        let Caller::Peer(peer) = caller else {
            return Ok(());
        };
        let record = self.ledger.read(jid).await?;

        if let Some(presented) = generation {
            let current = record.as_ref().map_or(0, |lock| lock.generation);
            if presented != current {
                warn!(job_id = %jid, peer = %peer, presented, current, "Stale lease report");
                return Err(PatrickError::StaleLease {
                    jid: jid.to_string(),
                    presented,
                    current,
                });
            }
        }

        if let Some(lock) = record.filter(|lock| lock.is_valid_at(self.now())) {
            if lock.owner != *peer {
                warn!(job_id = %jid, peer = %peer, owner = %lock.owner, "Report from non-owner");
                return Err(PatrickError::NotOwner {
                    jid: jid.to_string(),
                    caller: peer.clone(),
                    owner: lock.owner,
                });
            }
        }
        Ok(())
    }

    fn bump(&self, attempt: u32) -> u32 {
        attempt
            .saturating_add(1)
            .min(self.max_attempts)
            .max(attempt)
    }

    async fn spend_attempt(&self, mut job: Job) -> Result<Transition> {
        let next = job.attempt.saturating_add(1);
        if next >= self.max_attempts {
            job.attempt = self.bump(job.attempt);
            job.set_status(JobStatus::Failed);
            self.archive(&job).await?;
            return Ok(Transition::Archived(job));
        }

        job.attempt = next;
        job.set_status(JobStatus::Open);
        job.timestamp = self.now();
        self.requeue(&job).await?;
        Ok(Transition::Requeued(job))
    }

    async fn requeue(&self, job: &Job) -> Result<()> {
        self.store
            .put(&keys::active(&job.id), job.to_bytes())
            .await?;
        if let Some(lock) = self.ledger.read(&job.id).await? {
            self.ledger.expire(&job.id, lock, self.now()).await?;
        }
        info!(job_id = %job.id, attempt = job.attempt, "Job requeued");
        self.dispatcher.announce(job).await
    }

    /// Put archive, delete active, delete lock. Each step is idempotent and
    /// readers treat the archive copy as authoritative, so a crash between
    /// steps is repaired by [`Self::reconcile`].
    async fn archive(&self, job: &Job) -> Result<()> {
        self.store
            .put(&keys::archive(&job.id), job.to_bytes())
            .await?;
        self.drop_stale_copies(&job.id).await?;
        info!(
            job_id = %job.id,
            status = %job.status(),
            attempt = job.attempt,
            "Job archived"
        );
        Ok(())
    }
}

/// Outcome reports from a peer only apply to a job somebody locked. A
/// requeued or never-claimed job is `Open` and has nothing to report on.
fn require_locked(job: &Job, caller: &Caller) -> Result<()> {
    let Caller::Peer(peer) = caller else {
        return Ok(());
    };
    if job.status() == JobStatus::Locked {
        return Ok(());
    }
    warn!(job_id = %job.id, peer = %peer, status = %job.status(), "Report on unlocked job");
    Err(PatrickError::NotLocked {
        jid: job.id.clone(),
        caller: peer.clone(),
        status: job.status().to_string(),
    })
}
