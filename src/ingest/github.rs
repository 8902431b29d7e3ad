use serde::Deserialize;

use crate::error::{PatrickError, Result};
use crate::scheduler::{JobMeta, Repository};

pub const PROVIDER: &str = "github";
const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// The parts of a GitHub push event the scheduler keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
    pub repository: PushRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub id: u64,
    #[serde(default)]
    pub ssh_url: String,
}

impl PushPayload {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| PatrickError::InvalidArgument(format!("malformed push payload: {}", e)))
    }

    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix(BRANCH_REF_PREFIX)
            .unwrap_or(&self.git_ref)
    }

    pub fn into_meta(self) -> JobMeta {
        let branch = self.branch().to_string();
        JobMeta {
            git_ref: self.git_ref,
            before: self.before,
            after: self.after,
            head_commit: self.head_commit.map(|c| c.id).unwrap_or_default(),
            repository: Some(Repository {
                id: self.repository.id,
                provider: PROVIDER.to_string(),
                ssh_url: self.repository.ssh_url,
                branch,
            }),
        }
    }
}
