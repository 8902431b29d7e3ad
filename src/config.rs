use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collab::IdentitySeed;
use crate::ingest::IngestSettings;
use crate::scheduler::DEFAULT_MAX_JOB_ATTEMPTS;

const DEFAULT_REANNOUNCE_SECS: u64 = 300;
const DEV_REANNOUNCE_SECS: u64 = 5;

/// Scheduling policy knobs. Loaded from the `scheduler` section of the
/// config file; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempts before a failing job is archived as `Failed`.
    pub max_job_attempts: u32,
    /// Reannounce period. Unset means 300s, or 5s in dev mode.
    pub reannounce_interval_secs: Option<u64>,
    /// Most jobs republished per reannounce pass.
    pub reannounce_batch: usize,
    /// How many times an HTTP cancel waits for the job to be picked up.
    pub cancel_poll_attempts: u32,
    pub cancel_poll_interval_ms: u64,
    /// Branches that produce jobs outside dev mode.
    pub allowed_branches: Vec<String>,
    /// Test-only startup delay stamped on new jobs.
    pub delay_job_secs: Option<u32>,
    /// Webhook secret accepted for every hook in dev mode.
    pub dev_secret: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_job_attempts: DEFAULT_MAX_JOB_ATTEMPTS,
            reannounce_interval_secs: None,
            reannounce_batch: 100,
            cancel_poll_attempts: 10,
            cancel_poll_interval_ms: 2_000,
            allowed_branches: vec!["main".to_string(), "master".to_string()],
            delay_job_secs: None,
            dev_secret: None,
        }
    }
}

impl SchedulerConfig {
    pub fn reannounce_interval(&self, dev_mode: bool) -> Duration {
        let secs = self.reannounce_interval_secs.unwrap_or(if dev_mode {
            DEV_REANNOUNCE_SECS
        } else {
            DEFAULT_REANNOUNCE_SECS
        });
        Duration::from_secs(secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn ingest_settings(&self, dev_mode: bool) -> IngestSettings {
        IngestSettings {
            allowed_branches: self.allowed_branches.clone(),
            dev_mode,
            dev_secret: self.dev_secret.clone(),
            delay_job_secs: self.delay_job_secs,
        }
    }
}

/// TLS for the RPC server.
///
/// When enabled the server presents its certificate and requires workers to
/// present one signed by the same CA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Fall back to plaintext with a warning when files are missing.
    pub allow_insecure: bool,
}

impl TlsConfig {
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Layout of the optional YAML config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub scheduler: SchedulerConfig,
    pub identity: IdentitySeed,
    pub tls: Option<TlsConfig>,
}

impl FileConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, path)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Peer id this scheduler answers as.
    pub peer_id: String,
    pub rpc_addr: SocketAddr,
    /// `None` disables the HTTP surface.
    pub http_addr: Option<SocketAddr>,
    pub dev_mode: bool,
    pub scheduler: SchedulerConfig,
    pub tls: TlsConfig,
    pub identity: IdentitySeed,
    /// Directory serving logs and build outputs by content id.
    pub content_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: "patrick".to_string(),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            http_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
            dev_mode: false,
            scheduler: SchedulerConfig::default(),
            tls: TlsConfig::default(),
            identity: IdentitySeed::default(),
            content_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(peer_id: impl Into<String>, rpc_addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            rpc_addr,
            ..Default::default()
        }
    }

    /// Overlays the scheduler, identity, and TLS sections of a config file.
    pub fn with_file(mut self, file: FileConfig) -> Self {
        self.scheduler = file.scheduler;
        self.identity = file.identity;
        if let Some(tls) = file.tls {
            self.tls = tls;
        }
        self
    }

    pub fn reannounce_interval(&self) -> Duration {
        self.scheduler.reannounce_interval(self.dev_mode)
    }
}
