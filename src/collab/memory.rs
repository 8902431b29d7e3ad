use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::collab::{naming_key, ContentStore, Identity, Naming, WorkerClient};
use crate::dispatch::Dispatcher;
use crate::error::{PatrickError, Result};

/// Identity data loaded from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySeed {
    /// Webhook id to shared secret.
    pub hooks: BTreeMap<String, String>,
    /// Repository id to owning project id.
    pub repositories: BTreeMap<u64, String>,
    /// Accepted API tokens.
    pub tokens: Vec<String>,
    /// Naming keys present at startup.
    pub naming: Vec<String>,
}

#[derive(Debug, Default)]
pub struct StaticIdentity {
    hooks: BTreeMap<String, String>,
    repositories: BTreeMap<u64, String>,
    tokens: BTreeSet<String>,
}

impl StaticIdentity {
    pub fn from_seed(seed: &IdentitySeed) -> Self {
        Self {
            hooks: seed.hooks.clone(),
            repositories: seed.repositories.clone(),
            tokens: seed.tokens.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl Identity for StaticIdentity {
    async fn hook_secret(&self, hook_id: &str) -> Result<Option<String>> {
        Ok(self.hooks.get(hook_id).cloned())
    }

    async fn repository_project(
        &self,
        provider: &str,
        repository_id: u64,
    ) -> Result<Option<String>> {
        if !provider.eq_ignore_ascii_case("github") {
            return Ok(None);
        }
        Ok(self.repositories.get(&repository_id).cloned())
    }

    async fn validate_token(&self, token: &str) -> Result<bool> {
        Ok(!token.is_empty() && self.tokens.contains(token))
    }
}

#[derive(Debug, Default)]
pub struct MemoryNaming {
    entries: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryNaming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: &[String]) -> Self {
        let entries = keys
            .iter()
            .map(|key| (key.clone(), BTreeMap::new()))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn entry(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Naming for MemoryNaming {
    async fn lookup(&self, prefix: &[String]) -> Result<Vec<String>> {
        let prefix = naming_key(prefix);
        let nested = format!("{}/", prefix);
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|key| **key == prefix || key.starts_with(&nested))
            .cloned()
            .collect())
    }

    async fn push(&self, path: &[String], value: BTreeMap<String, String>) -> Result<()> {
        let key = naming_key(path);
        debug!(key = %key, "Naming entry pushed");
        self.entries.write().await.insert(key, value);
        Ok(())
    }
}

/// Sends cancel requests as directed notices on the announcement channel.
#[derive(Clone)]
pub struct NoticeWorkerClient {
    dispatcher: Dispatcher,
}

impl NoticeWorkerClient {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl WorkerClient for NoticeWorkerClient {
    async fn cancel(&self, peer: &str, jid: &str) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "action": "cancel",
            "jid": jid,
        }))
        .map_err(|e| PatrickError::Internal(e.to_string()))?;
        self.dispatcher.notify(peer, payload).await
    }
}

/// Blobs held in memory, keyed by content id.
#[derive(Debug, Default)]
pub struct MemoryContent {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, cid: impl Into<String>, data: Vec<u8>) {
        self.blobs.write().await.insert(cid.into(), data);
    }
}

#[async_trait]
impl ContentStore for MemoryContent {
    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(cid).cloned())
    }
}

/// Blobs stored as files named by their content id.
#[derive(Debug, Clone)]
pub struct DirContent {
    root: PathBuf,
}

impl DirContent {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn valid_cid(cid: &str) -> bool {
    !cid.is_empty()
        && cid != "."
        && cid != ".."
        && cid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[async_trait]
impl ContentStore for DirContent {
    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        if !valid_cid(cid) {
            return Err(PatrickError::InvalidArgument(format!(
                "malformed content id `{}`",
                cid
            )));
        }
        match tokio::fs::read(self.root.join(cid)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PatrickError::Collaborator(format!(
                "reading content {}: {}",
                cid, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::{BroadcastPublisher, NOTICE_TOPIC};

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn identity_answers_from_seed() {
        let seed: IdentitySeed = serde_yaml::from_str(
            r#"
hooks:
  hook-1: s3cret
repositories:
  42: proj-a
tokens: [tok]
"#,
        )
        .unwrap();
        let identity = StaticIdentity::from_seed(&seed);

        assert_eq!(
            identity.hook_secret("hook-1").await.unwrap().as_deref(),
            Some("s3cret")
        );
        assert_eq!(
            identity.repository_project("GitHub", 42).await.unwrap().as_deref(),
            Some("proj-a")
        );
        assert_eq!(identity.repository_project("gitlab", 42).await.unwrap(), None);
        assert!(identity.validate_token("tok").await.unwrap());
        assert!(!identity.validate_token("").await.unwrap());
    }

    #[tokio::test]
    async fn naming_lookup_matches_whole_segments() {
        let naming = MemoryNaming::with_keys(&[
            "/repositories/github/42/proj-a/config".to_string(),
            "/repositories/github/420/proj-b/config".to_string(),
        ]);

        let found = naming
            .lookup(&path(&["repositories", "github", "42"]))
            .await
            .unwrap();
        assert_eq!(found, vec!["/repositories/github/42/proj-a/config".to_string()]);
    }

    #[tokio::test]
    async fn naming_push_is_readable() {
        let naming = MemoryNaming::new();
        let mut value = BTreeMap::new();
        value.insert("id".to_string(), "42".to_string());
        naming
            .push(&path(&["resolve", "repo", "github", "42"]), value.clone())
            .await
            .unwrap();

        assert_eq!(naming.entry("/resolve/repo/github/42").await, Some(value));
    }

    #[tokio::test]
    async fn cancel_becomes_directed_notice() {
        let publisher = BroadcastPublisher::new(4);
        let mut rx = publisher.subscribe();
        let client = NoticeWorkerClient::new(Dispatcher::new(Arc::new(publisher)));

        client.cancel("peer-a", "jid1").await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.topic, NOTICE_TOPIC);
        assert_eq!(notice.target.as_deref(), Some("peer-a"));
        let body: serde_json::Value = serde_json::from_slice(&notice.payload).unwrap();
        assert_eq!(body["action"], "cancel");
        assert_eq!(body["jid"], "jid1");
    }

    #[tokio::test]
    async fn dir_content_rejects_traversal_and_reports_missing() {
        let dir = std::env::temp_dir().join(format!("patrick-content-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("cid1"), b"hello").await.unwrap();
        let content = DirContent::new(&dir);

        assert_eq!(content.get("cid1").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(content.get("cid2").await.unwrap(), None);
        assert!(content.get("../etc/passwd").await.is_err());
        assert!(content.get("..").await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
