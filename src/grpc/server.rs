use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::dispatch::BroadcastPublisher;
use crate::error::Result;
use crate::grpc::command_service::CommandService;
use crate::proto::patrick_service_server::PatrickServiceServer;
use crate::scheduler::JobStateMachine;
use crate::tls::TlsIdentity;

pub struct GrpcServer {
    addr: SocketAddr,
    machine: Arc<JobStateMachine>,
    publisher: BroadcastPublisher,
    tls_identity: Option<TlsIdentity>,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        machine: Arc<JobStateMachine>,
        publisher: BroadcastPublisher,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        Self {
            addr,
            machine,
            publisher,
            tls_identity,
        }
    }

    /// Serves until `shutdown` fires, then drains in-flight calls.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let service = CommandService::new(self.machine, self.publisher);

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls_identity {
            builder = builder.tls_config(tls.server_tls_config())?;
        }

        tracing::info!(
            addr = %self.addr,
            tls = self.tls_identity.is_some(),
            "Starting gRPC server"
        );

        builder
            .add_service(PatrickServiceServer::new(service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
