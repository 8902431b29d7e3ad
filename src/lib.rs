pub mod collab;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod ingest;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod web;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("patrick");
}
