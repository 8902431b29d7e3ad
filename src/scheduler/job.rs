use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{PatrickError, Result};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    prost::Enumeration,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum JobStatus {
    Open = 0,
    Locked = 1,
    Success = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    /// Terminal statuses live in the archive range.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Open => write!(f, "open"),
            JobStatus::Locked => write!(f, "locked"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Repository that triggered a job.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct Repository {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub provider: String,
    #[prost(string, tag = "3")]
    pub ssh_url: String,
    #[prost(string, tag = "4")]
    pub branch: String,
}

/// Immutable description of the change that produced a job.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct JobMeta {
    #[prost(string, tag = "1")]
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[prost(string, tag = "2")]
    pub before: String,
    #[prost(string, tag = "3")]
    pub after: String,
    #[prost(string, tag = "4")]
    pub head_commit: String,
    #[prost(message, optional, tag = "5")]
    pub repository: Option<Repository>,
}

/// Artificial startup delay, only set by test deployments.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct DelayConfig {
    #[prost(uint32, tag = "1")]
    pub time: u32,
}

/// The unit of work announced to build workers.
///
/// Stored under `/jobs/{id}` while active and `/archive/jobs/{id}` once
/// terminal. The binary encoding uses integer field tags so fields can be
/// added without breaking older readers.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Job {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "JobStatus", tag = "2")]
    #[serde(with = "status_field")]
    pub status: i32,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(uint32, tag = "4")]
    pub attempt: u32,
    #[prost(btree_map = "string, string", tag = "5")]
    pub logs: BTreeMap<String, String>,
    #[prost(btree_map = "string, string", tag = "6")]
    #[serde(rename = "assetCid")]
    pub asset_cid: BTreeMap<String, String>,
    #[prost(message, optional, tag = "7")]
    pub meta: Option<JobMeta>,
    #[prost(message, optional, tag = "8")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayConfig>,
}

impl Job {
    /// A fresh `Open` job at attempt zero with empty logs and assets.
    pub fn open(id: String, meta: JobMeta, timestamp: i64) -> Self {
        Self {
            id,
            status: JobStatus::Open as i32,
            timestamp,
            attempt: 0,
            logs: BTreeMap::new(),
            asset_cid: BTreeMap::new(),
            meta: Some(meta),
            delay: None,
        }
    }

    pub fn repository(&self) -> Option<&Repository> {
        self.meta.as_ref().and_then(|m| m.repository.as_ref())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        prost::Message::encode_to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        <Self as prost::Message>::decode(bytes).map_err(PatrickError::from)
    }
}

/// Derives a job id from the repository id and a uniqueness salt.
pub fn generate_id(repository_id: u64, salt: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.to_be_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..20])
}

mod status_field {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::JobStatus;

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        JobStatus::try_from(*value)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        Ok(JobStatus::deserialize(deserializer)? as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> JobMeta {
        JobMeta {
            git_ref: "refs/heads/main".to_string(),
            before: "aaa".to_string(),
            after: "bbb".to_string(),
            head_commit: "bbb".to_string(),
            repository: Some(Repository {
                id: 42,
                provider: "github".to_string(),
                ssh_url: "git@github.com:org/repo.git".to_string(),
                branch: "main".to_string(),
            }),
        }
    }

    #[test]
    fn open_job_defaults() {
        let job = Job::open("jid1".to_string(), meta(), 1_700_000_000);
        assert_eq!(job.status(), JobStatus::Open);
        assert_eq!(job.attempt, 0);
        assert!(job.logs.is_empty());
        assert!(job.asset_cid.is_empty());
        assert_eq!(job.repository().map(|r| r.id), Some(42));
    }

    #[test]
    fn record_survives_binary_encoding() {
        let mut job = Job::open("jid1".to_string(), meta(), 1_700_000_000);
        job.set_status(JobStatus::Failed);
        job.attempt = 2;
        job.logs.insert("res1".to_string(), "cid-log".to_string());

        let decoded = Job::from_bytes(&job.to_bytes()).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(decoded.status(), JobStatus::Failed);
    }

    #[test]
    fn json_view_uses_status_names() {
        let job = Job::open("jid1".to_string(), meta(), 10);
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["status"], "open");
        assert_eq!(value["meta"]["ref"], "refs/heads/main");
        assert_eq!(value["meta"]["repository"]["id"], 42);
        assert!(value.get("delay").is_none());
        assert!(value["assetCid"].as_object().unwrap().is_empty());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Job::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn ids_are_stable_for_same_inputs_and_salted() {
        let salt = Uuid::new_v4();
        assert_eq!(generate_id(42, salt), generate_id(42, salt));
        assert_ne!(generate_id(42, salt), generate_id(42, Uuid::new_v4()));
        assert_eq!(generate_id(42, salt).len(), 40);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Open.is_terminal());
        assert!(!JobStatus::Locked.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
