#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use patrick::dispatch::{Announcement, BroadcastPublisher, Dispatcher};
use patrick::scheduler::{Clock, Job, JobMeta, JobStateMachine, ManualClock, Repository};
use patrick::store::MemoryStore;

pub const START: i64 = 1_700_000_000;

/// State machine wired to an in-memory store and a clock the test drives.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub publisher: BroadcastPublisher,
    pub machine: Arc<JobStateMachine>,
}

impl Harness {
    pub fn new(max_attempts: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(START);
        let publisher = BroadcastPublisher::new(64);
        let machine = Arc::new(JobStateMachine::new(
            store.clone(),
            Dispatcher::new(Arc::new(publisher.clone())),
            Arc::new(clock.clone()),
            max_attempts,
        ));
        Self {
            store,
            clock,
            publisher,
            machine,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.publisher.subscribe()
    }

    /// Registers an `Open` job under `project`.
    pub async fn open_job(&self, jid: &str, project: &str) -> Job {
        self.open_job_at(jid, project, 0).await
    }

    pub async fn open_job_at(&self, jid: &str, project: &str, attempt: u32) -> Job {
        let mut job = Job::open(jid.to_string(), meta(42, "main"), self.clock.now());
        job.attempt = attempt;
        self.machine.register(&job, project).await.unwrap();
        job
    }
}

pub fn meta(repository_id: u64, branch: &str) -> JobMeta {
    JobMeta {
        git_ref: format!("refs/heads/{}", branch),
        before: "0000000".to_string(),
        after: "abc1234".to_string(),
        head_commit: "abc1234".to_string(),
        repository: Some(Repository {
            id: repository_id,
            provider: "github".to_string(),
            ssh_url: format!("git@github.com:acme/repo-{}.git", repository_id),
            branch: branch.to_string(),
        }),
    }
}

/// A GitHub push payload for `repository_id` on `branch`.
pub fn push_body(repository_id: u64, branch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": format!("refs/heads/{}", branch),
        "before": "0000000",
        "after": "abc1234",
        "head_commit": { "id": "abc1234" },
        "repository": {
            "id": repository_id,
            "ssh_url": format!("git@github.com:acme/repo-{}.git", repository_id),
        },
    }))
    .unwrap()
}
