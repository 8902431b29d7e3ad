//! Services the scheduler talks to but does not own.
//!
//! Each collaborator is a trait so the node can be wired against real
//! clients or the in-process implementations in [`memory`].

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{
    DirContent, IdentitySeed, MemoryContent, MemoryNaming, NoticeWorkerClient, StaticIdentity,
};

/// Secrets, repository ownership, and API tokens.
#[async_trait]
pub trait Identity: Send + Sync + 'static {
    /// Shared secret registered for a webhook, if any.
    async fn hook_secret(&self, hook_id: &str) -> Result<Option<String>>;

    /// Project that owns a repository, if the identity service knows it.
    async fn repository_project(&self, provider: &str, repository_id: u64)
        -> Result<Option<String>>;

    async fn validate_token(&self, token: &str) -> Result<bool>;
}

/// Hierarchical naming service.
#[async_trait]
pub trait Naming: Send + Sync + 'static {
    /// Full keys under `prefix`, slash-joined with a leading slash.
    async fn lookup(&self, prefix: &[String]) -> Result<Vec<String>>;

    async fn push(&self, path: &[String], value: BTreeMap<String, String>) -> Result<()>;
}

/// Directs requests at one worker.
#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    async fn cancel(&self, peer: &str, jid: &str) -> Result<()>;
}

/// Content-addressed blob storage for logs and build outputs.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>>;
}

/// Joins path segments the way naming keys are written.
pub fn naming_key(path: &[String]) -> String {
    let mut key = String::new();
    for segment in path {
        key.push('/');
        key.push_str(segment);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_key_has_leading_slash() {
        let path = vec!["resolve".to_string(), "repo".to_string(), "42".to_string()];
        assert_eq!(naming_key(&path), "/resolve/repo/42");
        assert_eq!(naming_key(&[]), "");
    }
}
