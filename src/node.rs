use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collab::{
    ContentStore, DirContent, Identity, MemoryContent, MemoryNaming, Naming, NoticeWorkerClient,
    StaticIdentity, WorkerClient,
};
use crate::config::NodeConfig;
use crate::dispatch::{BroadcastPublisher, Dispatcher, Reannouncer};
use crate::grpc::GrpcServer;
use crate::ingest::Ingestor;
use crate::scheduler::{JobStateMachine, SystemClock};
use crate::store::MemoryStore;
use crate::tls::TlsIdentity;
use crate::web::{run_http, CancelPolicy, WebState};

/// A scheduler process: store, state machine, and both command surfaces.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<MemoryStore>,
    pub publisher: BroadcastPublisher,
    pub machine: Arc<JobStateMachine>,
    pub ingestor: Arc<Ingestor>,
    pub identity: Arc<dyn Identity>,
    pub workers: Arc<dyn WorkerClient>,
    pub content: Arc<dyn ContentStore>,
    tls_identity: Option<TlsIdentity>,
}

impl Node {
    pub fn new(config: NodeConfig, tls_identity: Option<TlsIdentity>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let publisher = BroadcastPublisher::default();
        let dispatcher = Dispatcher::new(Arc::new(publisher.clone()));
        let machine = Arc::new(JobStateMachine::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(SystemClock),
            config.scheduler.max_job_attempts,
        ));

        let identity: Arc<dyn Identity> = Arc::new(StaticIdentity::from_seed(&config.identity));
        let naming: Arc<dyn Naming> = Arc::new(MemoryNaming::with_keys(&config.identity.naming));
        let ingestor = Arc::new(Ingestor::new(
            machine.clone(),
            identity.clone(),
            naming,
            config.scheduler.ingest_settings(config.dev_mode),
        ));
        let workers: Arc<dyn WorkerClient> = Arc::new(NoticeWorkerClient::new(dispatcher));
        let content: Arc<dyn ContentStore> = match &config.content_dir {
            Some(dir) => Arc::new(DirContent::new(dir.clone())),
            None => Arc::new(MemoryContent::new()),
        };

        Self {
            config,
            store,
            publisher,
            machine,
            ingestor,
            identity,
            workers,
            content,
            tls_identity,
        }
    }

    pub fn web_state(&self) -> WebState {
        WebState {
            machine: self.machine.clone(),
            ingestor: self.ingestor.clone(),
            identity: self.identity.clone(),
            workers: self.workers.clone(),
            content: self.content.clone(),
            cancel: CancelPolicy {
                attempts: self.config.scheduler.cancel_poll_attempts,
                interval: self.config.scheduler.cancel_poll_interval(),
            },
        }
    }

    /// Runs the reannounce loop, the HTTP server, and the RPC server until
    /// `shutdown` fires.
    ///
    /// The RPC server runs on the calling task; the other two are spawned
    /// and joined once it returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the RPC server fails to start or stops with a
    /// transport error. HTTP failures are logged and cancel the node.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let reannouncer = Reannouncer::new(
            self.machine.clone(),
            self.config.reannounce_interval(),
            self.config.scheduler.reannounce_batch,
        );
        let reannounce_task = tokio::spawn(reannouncer.run(shutdown.clone()));

        let http_task = self.config.http_addr.map(|addr| {
            let state = self.web_state();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = run_http(addr, state, shutdown.clone()).await {
                    tracing::error!(error = %e, "HTTP server failed");
                    shutdown.cancel();
                }
            })
        });

        let server = GrpcServer::new(
            self.config.rpc_addr,
            self.machine.clone(),
            self.publisher.clone(),
            self.tls_identity,
        );
        let result = server.run(shutdown.clone()).await;
        shutdown.cancel();

        join_task("reannounce", reannounce_task).await;
        if let Some(task) = http_task {
            join_task("http", task).await;
        }
        self.store.close();

        tracing::info!(peer_id = %self.config.peer_id, "Node stopped");
        result.map_err(Into::into)
    }
}

/// Waits for a background task. Returns false if it panicked or was aborted.
async fn join_task(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(task = name, error = %e, "Background task failed");
            false
        }
    }
}
