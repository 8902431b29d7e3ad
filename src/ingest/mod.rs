//! Turns verified push notifications into jobs.

pub mod github;
pub mod signature;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{Identity, Naming};
use crate::error::{PatrickError, Result};
use crate::scheduler::job::{generate_id, DelayConfig};
use crate::scheduler::{Job, JobStateMachine, Repository};

pub use github::PushPayload;
pub use signature::Signatures;

/// The only event kind that produces jobs.
pub const PUSH_EVENT: &str = "push";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub allowed_branches: Vec<String>,
    /// Accept any branch and allow `dev_secret`.
    pub dev_mode: bool,
    pub dev_secret: Option<String>,
    pub delay_job_secs: Option<u32>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            allowed_branches: vec!["main".to_string(), "master".to_string()],
            dev_mode: false,
            dev_secret: None,
            delay_job_secs: None,
        }
    }
}

/// One inbound webhook delivery.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub hook_id: &'a str,
    /// `X-GitHub-Event`
    pub event: Option<&'a str>,
    pub signatures: Signatures<'a>,
    pub body: &'a [u8],
}

pub struct Ingestor {
    machine: Arc<JobStateMachine>,
    identity: Arc<dyn Identity>,
    naming: Arc<dyn Naming>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        machine: Arc<JobStateMachine>,
        identity: Arc<dyn Identity>,
        naming: Arc<dyn Naming>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            machine,
            identity,
            naming,
            settings,
        }
    }

    /// Verifies, validates, and registers a push. Nothing is written before
    /// the signature, branch, and owning project all check out.
    pub async fn ingest(&self, delivery: Delivery<'_>) -> Result<Job> {
        let secret = self.secret_for(delivery.hook_id).await?;
        signature::verify(&secret, delivery.body, delivery.signatures)?;

        match delivery.event {
            Some(PUSH_EVENT) => {}
            Some(other) => {
                return Err(PatrickError::InvalidArgument(format!(
                    "not a push event: `{}`",
                    other
                )))
            }
            None => {
                return Err(PatrickError::InvalidArgument(
                    "missing event header".to_string(),
                ))
            }
        }

        let meta = PushPayload::parse(delivery.body)?.into_meta();
        let Some(repository) = meta.repository.clone() else {
            return Err(PatrickError::InvalidArgument(
                "push payload has no repository".to_string(),
            ));
        };

        if !self.settings.dev_mode
            && !self
                .settings
                .allowed_branches
                .iter()
                .any(|b| *b == repository.branch)
        {
            return Err(PatrickError::BranchNotAllowed {
                branch: repository.branch,
                allowed: self.settings.allowed_branches.clone(),
            });
        }

        let project_id = self.resolve_project(&repository).await?;
        self.register_repository(&repository).await?;

        let mut job = Job::open(
            generate_id(repository.id, Uuid::new_v4()),
            meta,
            self.machine.now(),
        );
        if let Some(time) = self.settings.delay_job_secs {
            job.delay = Some(DelayConfig { time });
        }

        self.machine.register(&job, &project_id).await?;
        info!(
            job_id = %job.id,
            repository = repository.id,
            branch = %repository.branch,
            project = %project_id,
            "Push ingested"
        );
        Ok(job)
    }

    async fn secret_for(&self, hook_id: &str) -> Result<String> {
        if self.settings.dev_mode {
            if let Some(secret) = &self.settings.dev_secret {
                return Ok(secret.clone());
            }
        }
        self.identity
            .hook_secret(hook_id)
            .await?
            .ok_or_else(|| PatrickError::Signature(format!("unknown hook `{}`", hook_id)))
    }

    /// Asks the identity service first, then falls back to naming keys of
    /// the form `/repositories/{provider}/{id}/{project}/...`.
    pub async fn resolve_project(&self, repository: &Repository) -> Result<String> {
        if let Some(project) = self
            .identity
            .repository_project(&repository.provider, repository.id)
            .await?
            .filter(|p| !p.is_empty())
        {
            return Ok(project);
        }

        let prefix = vec![
            "repositories".to_string(),
            repository.provider.to_lowercase(),
            repository.id.to_string(),
        ];
        let keys = self.naming.lookup(&prefix).await?;
        debug!(repository = repository.id, keys = keys.len(), "Naming lookup for project");

        project_from_keys(&keys).ok_or_else(|| {
            warn!(repository = repository.id, "No project owns repository");
            PatrickError::ProjectNotFound(repository.id.to_string())
        })
    }

    async fn register_repository(&self, repository: &Repository) -> Result<()> {
        let path = vec![
            "resolve".to_string(),
            "repo".to_string(),
            github::PROVIDER.to_string(),
            repository.id.to_string(),
        ];
        let mut value = BTreeMap::new();
        value.insert("id".to_string(), repository.id.to_string());
        value.insert("ssh".to_string(), repository.ssh_url.clone());
        self.naming.push(&path, value).await
    }
}

/// Project id is the fourth segment of a naming key.
fn project_from_keys(keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|key| key.split('/').nth(4))
        .find(|project| !project.is_empty())
        .map(str::to_string)
}
