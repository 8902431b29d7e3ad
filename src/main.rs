use clap::{Parser, ValueEnum};
use prost::Message;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing_subscriber::EnvFilter;

use patrick::config::{FileConfig, NodeConfig, TlsConfig};
use patrick::grpc::{PEER_ID_HEADER, STATS_ACTION};
use patrick::node::Node;
use patrick::proto::patrick_service_client::PatrickServiceClient;
use patrick::proto::{CommandRequest, StatsRequest};
use patrick::shutdown::install_shutdown_handler;
use patrick::store::StoreStats;
use patrick::tls::{TlsIdentity, TLS_DOMAIN};

#[derive(Parser, Debug)]
#[command(name = "patrick")]
#[command(version)]
#[command(about = "Job scheduler for a distributed build platform")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a scheduler node
    Server(ServerArgs),

    /// Job inspection commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Peer id this scheduler answers as
    #[arg(long, default_value = "patrick")]
    peer_id: String,

    /// Port to listen on for the RPC command surface
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for the HTTP surface (webhooks and job queries)
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Disable the HTTP surface
    #[arg(long)]
    no_http: bool,

    /// Development mode: any branch builds, short reannounce interval
    #[arg(long)]
    dev: bool,

    /// YAML config file (scheduler, identity, and tls sections)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory serving logs and build outputs by content id
    #[arg(long)]
    content_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    // === TLS Options ===
    /// Enable TLS for the RPC surface
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to node certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to node private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Run without TLS when --tls is given but certificates cannot be loaded.
    /// NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Peer id sent with each command
    #[arg(long, default_value = "patrick-cli")]
    peer_id: String,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List active and archived job ids
    List,
    /// Show one job, archived copy first
    Info {
        /// The job id
        jid: String,
    },
    /// Show store statistics
    Stats,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn create_client_channel(
    args: &ClientArgs,
) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    let has_tls = args.ca_cert.is_some() || args.addr.starts_with("https://");
    if !has_tls {
        return Ok(endpoint.connect().await?);
    }

    let mut tls_config = ClientTlsConfig::new().domain_name(TLS_DOMAIN);
    if let Some(ca_path) = &args.ca_cert {
        let ca_cert = tokio::fs::read(ca_path).await?;
        tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_cert));
    }
    if let (Some(cert_path), Some(key_path)) = (&args.cert, &args.key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        tls_config = tls_config.identity(Identity::from_pem(cert, key));
    }

    Ok(endpoint.tls_config(tls_config)?.connect().await?)
}

async fn send_command(
    client: &mut PatrickServiceClient<Channel>,
    peer_id: &str,
    command: CommandRequest,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut request = tonic::Request::new(command);
    request.metadata_mut().insert(PEER_ID_HEADER, peer_id.parse()?);
    let response = client.command(request).await?.into_inner();
    Ok(serde_json::from_str(&response.body)?)
}

// =============================================================================
// Server
// =============================================================================

async fn load_tls(
    tls_config: &TlsConfig,
) -> Result<Option<TlsIdentity>, Box<dyn std::error::Error>> {
    if tls_config.is_complete() {
        match TlsIdentity::load(tls_config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if tls_config.allow_insecure => {
                tracing::warn!(
                    error = %e,
                    "TLS certificate loading failed, running in insecure mode"
                );
                Ok(None)
            }
            Err(e) => Err(format!("TLS certificate loading failed: {}", e).into()),
        }
    } else if tls_config.enabled {
        if tls_config.allow_insecure {
            tracing::warn!(
                "TLS enabled but certificate paths incomplete, running in insecure mode"
            );
            Ok(None)
        } else {
            Err("TLS enabled but missing required paths (--ca-cert, --cert, --key)".into())
        }
    } else {
        Ok(None)
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&args.log_format);

    let rpc_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let http_addr: Option<SocketAddr> = if args.no_http {
        None
    } else {
        Some(format!("0.0.0.0:{}", args.http_port).parse()?)
    };

    let mut config = NodeConfig::new(args.peer_id, rpc_addr);
    if let Some(path) = &args.config {
        config = config.with_file(FileConfig::load(path).await?);
    }
    config.http_addr = http_addr;
    config.dev_mode = args.dev;
    if args.content_dir.is_some() {
        config.content_dir = args.content_dir;
    }
    if args.tls {
        config.tls = TlsConfig {
            enabled: true,
            ca_cert_path: args.ca_cert,
            cert_path: args.cert,
            key_path: args.key,
            allow_insecure: args.allow_insecure,
        };
    }

    let tls_identity = load_tls(&config.tls).await?;

    tracing::info!(
        peer_id = %config.peer_id,
        rpc_addr = %config.rpc_addr,
        http_addr = ?config.http_addr,
        dev_mode = config.dev_mode,
        tls_enabled = tls_identity.is_some(),
        max_job_attempts = config.scheduler.max_job_attempts,
        reannounce_interval = ?config.reannounce_interval(),
        "Starting patrick node"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config, tls_identity).run(shutdown).await
}

// =============================================================================
// Job Commands
// =============================================================================

async fn handle_job_list(
    client: &mut PatrickServiceClient<Channel>,
    peer_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let reply = send_command(
        client,
        peer_id,
        CommandRequest {
            action: "list".to_string(),
            ..Default::default()
        },
    )
    .await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reply)?),
        OutputFormat::Table => {
            let ids = reply["Ids"].as_array().cloned().unwrap_or_default();
            println!("JOB ID");
            println!("{}", "-".repeat(40));
            for id in &ids {
                println!("{}", id.as_str().unwrap_or_default());
            }
            println!("\nTotal: {} jobs", ids.len());
        }
    }
    Ok(())
}

async fn handle_job_info(
    client: &mut PatrickServiceClient<Channel>,
    peer_id: &str,
    jid: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let reply = send_command(
        client,
        peer_id,
        CommandRequest {
            action: "info".to_string(),
            jid,
            ..Default::default()
        },
    )
    .await?;

    let job = &reply["job"];
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", job["id"].as_str().unwrap_or_default());
            println!("Status:     {}", job["status"].as_str().unwrap_or_default());
            println!("Attempt:    {}", job["attempt"]);
            println!("Timestamp:  {}", job["timestamp"]);
            if let Some(repo) = job["meta"]["repository"].as_object() {
                println!(
                    "Repository: {} ({})",
                    repo.get("id").cloned().unwrap_or_default(),
                    repo.get("branch")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                );
            }
            for (name, field) in [("Logs", "logs"), ("Assets", "assetCid")] {
                if let Some(entries) = job[field].as_object().filter(|e| !e.is_empty()) {
                    println!("{}:", name);
                    for (key, cid) in entries {
                        println!("  {}: {}", key, cid.as_str().unwrap_or_default());
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_stats(
    client: &mut PatrickServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .stats(StatsRequest {
            action: STATS_ACTION.to_string(),
        })
        .await?
        .into_inner();
    let stats = StoreStats::decode(response.stats.as_slice())?;

    match output_format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "keys": stats.keys,
                "bytes": stats.bytes,
                "puts": stats.puts,
                "gets": stats.gets,
                "deletes": stats.deletes,
                "lists": stats.lists,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Keys:    {}", stats.keys);
            println!("Bytes:   {}", stats.bytes);
            println!("Puts:    {}", stats.puts);
            println!("Gets:    {}", stats.gets);
            println!("Deletes: {}", stats.deletes);
            println!("Lists:   {}", stats.lists);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = PatrickServiceClient::new(channel);

            match command {
                JobCommands::List => {
                    handle_job_list(&mut grpc_client, &client.peer_id, &client.output).await?;
                }
                JobCommands::Info { jid } => {
                    handle_job_info(&mut grpc_client, &client.peer_id, jid, &client.output)
                        .await?;
                }
                JobCommands::Stats => {
                    handle_job_stats(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
