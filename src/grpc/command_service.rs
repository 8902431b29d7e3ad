use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::dispatch::BroadcastPublisher;
use crate::grpc::action::{self, Action};
use crate::proto::patrick_service_server::PatrickService;
use crate::proto::{
    Announcement as ProtoAnnouncement, CommandRequest, CommandResponse, PingRequest, PingResponse,
    StatsRequest, StatsResponse, SubscribeRequest,
};
use crate::scheduler::JobStateMachine;

/// Metadata entry carrying the calling peer's id.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// The only action `Stats` answers.
pub const STATS_ACTION: &str = "db";

type AnnouncementStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<ProtoAnnouncement, Status>> + Send>>;

/// Worker-facing RPC surface.
pub struct CommandService {
    machine: Arc<JobStateMachine>,
    publisher: BroadcastPublisher,
}

impl CommandService {
    pub fn new(machine: Arc<JobStateMachine>, publisher: BroadcastPublisher) -> Self {
        Self { machine, publisher }
    }
}

fn peer_of<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(PEER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(str::to_string)
}

#[tonic::async_trait]
impl PatrickService for CommandService {
    type SubscribeStream = AnnouncementStream;

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            time: self.machine.now(),
        }))
    }

    async fn command(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let peer = peer_of(&request);
        let req = request.into_inner();
        let action: Action = req.action.parse()?;

        let reply = action::execute(&self.machine, action, peer, req)
            .await
            .map_err(|e| {
                debug!(action = %action, error = %e, "Command rejected");
                Status::from(e)
            })?;

        let body = serde_json::to_string(&reply)
            .map_err(|e| Status::internal(format!("Failed to encode reply: {}", e)))?;
        Ok(Response::new(CommandResponse { body }))
    }

    async fn stats(
        &self,
        request: Request<StatsRequest>,
    ) -> Result<Response<StatsResponse>, Status> {
        let req = request.into_inner();
        if req.action != STATS_ACTION {
            return Err(Status::invalid_argument(format!(
                "Unknown stats action `{}`",
                req.action
            )));
        }
        let stats = self.machine.stats().await;
        Ok(Response::new(StatsResponse {
            stats: stats.to_bytes(),
        }))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let peer = peer_of(&request);
        let topic = request.into_inner().topic;
        info!(peer = ?peer, topic = %topic, "Worker subscribed");

        let stream = BroadcastStream::new(self.publisher.subscribe()).filter_map(move |item| {
            match item {
                Ok(announcement) => {
                    if !topic.is_empty() && announcement.topic != topic {
                        return None;
                    }
                    match &announcement.target {
                        Some(target) if peer.as_deref() != Some(target.as_str()) => None,
                        _ => Some(Ok(ProtoAnnouncement {
                            topic: announcement.topic,
                            payload: announcement.payload.to_vec(),
                            target: announcement.target.unwrap_or_default(),
                        })),
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, announcements dropped");
                    None
                }
            }
        });

        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }
}
