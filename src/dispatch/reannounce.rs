use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::scheduler::{JobStateMachine, LockState};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Counters for one pass over the active range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: usize,
    pub republished: usize,
    pub reconciled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Republished,
    Reconciled,
    Skipped,
}

/// Periodically redelivers jobs nobody is working on.
///
/// A job is due when its lease has lapsed, or when it has no lease at all
/// and was last announced more than one interval ago. The record goes out
/// unchanged; attempt accounting is left to `timeout`.
///
/// A pass that hits the batch cap remembers where it stopped, and the next
/// pass resumes after that job, wrapping around the end of the range.
pub struct Reannouncer {
    machine: Arc<JobStateMachine>,
    interval: Duration,
    batch: usize,
    cursor: Mutex<Option<String>>,
}

impl Reannouncer {
    pub fn new(machine: Arc<JobStateMachine>, interval: Duration, batch: usize) -> Self {
        Self {
            machine,
            interval: interval.max(MIN_INTERVAL),
            batch: batch.max(1),
            cursor: Mutex::new(None),
        }
    }

    /// Runs passes on the interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval = ?self.interval, batch = self.batch, "Reannounce loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reannounce loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.pass().await {
                        Ok(report) => debug!(
                            scanned = report.scanned,
                            republished = report.republished,
                            reconciled = report.reconciled,
                            failed = report.failed,
                            "Reannounce pass complete"
                        ),
                        Err(e) => error!(error = %e, "Reannounce pass failed"),
                    }
                }
            }
        }
    }

    /// One scan of the active range. Per-job failures are logged and
    /// counted; only a failure to list the range aborts the pass.
    pub async fn pass(&self) -> Result<PassReport> {
        let mut ids = self.machine.list_active().await?;
        let now = self.machine.now();
        let stale_before = now.saturating_sub(self.interval.as_secs() as i64);

        let mut cursor = self.cursor.lock().await;
        if let Some(last) = cursor.as_deref() {
            let start = ids.partition_point(|jid| jid.as_str() <= last);
            ids.rotate_left(start);
        }

        let mut report = PassReport::default();
        let mut resume_after = None;
        for jid in ids {
            if report.republished >= self.batch {
                debug!(batch = self.batch, resume_after = ?resume_after, "Reannounce cap reached");
                break;
            }
            report.scanned += 1;

            match self.visit(&jid, now, stale_before).await {
                Ok(Visit::Republished) => report.republished += 1,
                Ok(Visit::Reconciled) => report.reconciled += 1,
                Ok(Visit::Skipped) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(job_id = %jid, error = %e, "Failed to reannounce job");
                }
            }
            resume_after = Some(jid);
        }

        *cursor = if report.republished >= self.batch {
            resume_after
        } else {
            None
        };
        Ok(report)
    }

    async fn visit(&self, jid: &str, now: i64, stale_before: i64) -> Result<Visit> {
        if self.machine.reconcile(jid).await? {
            debug!(job_id = %jid, "Removed stale copies of archived job");
            return Ok(Visit::Reconciled);
        }
        let Some(job) = self.machine.active(jid).await? else {
            return Ok(Visit::Skipped);
        };

        let due = match self.machine.ledger().inspect(jid, now).await? {
            LockState::Held(_) => false,
            LockState::Expired(_) => true,
            LockState::Absent => job.timestamp <= stale_before,
        };
        if !due {
            return Ok(Visit::Skipped);
        }

        self.machine.dispatcher().announce(&job).await?;
        Ok(Visit::Republished)
    }
}
