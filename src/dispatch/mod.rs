//! Job announcement.
//!
//! New and requeued jobs are published once on the transition that produced
//! them. The [`reannounce::Reannouncer`] loop redelivers jobs whose lease
//! lapsed without a result.

pub mod reannounce;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{PatrickError, Result};
use crate::scheduler::Job;

pub use reannounce::{PassReport, Reannouncer};

/// Topic workers listen on for announced jobs.
pub const DISPATCH_TOPIC: &str = "patrick";

/// Topic carrying directed notices, such as cancel requests, to one worker.
pub const NOTICE_TOPIC: &str = "patrick/notice";

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub topic: String,
    pub payload: Bytes,
    /// Peer the announcement is meant for. `None` means every subscriber.
    pub target: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, announcement: Announcement) -> Result<()>;
}

/// In-process fan-out over a tokio broadcast channel. The gRPC `Subscribe`
/// stream hands these to connected workers.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Announcement>,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, announcement: Announcement) -> Result<()> {
        let topic = announcement.topic.clone();
        match self.tx.send(announcement) {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Announcement sent");
            }
            Err(_) => {
                // Nobody is subscribed right now; the reannounce loop
                // covers jobs that nobody picked up.
                debug!(topic = %topic, "No subscribers for announcement");
            }
        }
        Ok(())
    }
}

/// Encodes jobs and puts them on the dispatch topic.
#[derive(Clone)]
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    pub async fn announce(&self, job: &Job) -> Result<()> {
        self.publisher
            .publish(Announcement {
                topic: DISPATCH_TOPIC.to_string(),
                payload: Bytes::from(job.to_bytes()),
                target: None,
            })
            .await
            .map_err(|e| PatrickError::Publish(format!("job {}: {}", job.id, e)))?;
        info!(job_id = %job.id, attempt = job.attempt, "Job announced");
        Ok(())
    }

    pub async fn notify(&self, target: &str, payload: Vec<u8>) -> Result<()> {
        self.publisher
            .publish(Announcement {
                topic: NOTICE_TOPIC.to_string(),
                payload: Bytes::from(payload),
                target: Some(target.to_string()),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobMeta;

    #[tokio::test]
    async fn announce_reaches_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        let dispatcher = Dispatcher::new(Arc::new(publisher));

        let job = Job::open("jid1".to_string(), JobMeta::default(), 5);
        dispatcher.announce(&job).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, DISPATCH_TOPIC);
        assert_eq!(got.target, None);
        assert_eq!(Job::from_bytes(&got.payload).unwrap(), job);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let dispatcher = Dispatcher::new(Arc::new(BroadcastPublisher::new(8)));
        let job = Job::open("jid1".to_string(), JobMeta::default(), 5);
        assert!(dispatcher.announce(&job).await.is_ok());
    }

    #[tokio::test]
    async fn notices_carry_their_target() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        let dispatcher = Dispatcher::new(Arc::new(publisher));

        dispatcher.notify("peer-a", b"jid1".to_vec()).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, NOTICE_TOPIC);
        assert_eq!(got.target.as_deref(), Some("peer-a"));
        assert_eq!(&got.payload[..], b"jid1");
    }
}
