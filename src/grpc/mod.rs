pub mod action;
pub mod command_service;
pub mod server;

pub use action::Action;
pub use command_service::{CommandService, PEER_ID_HEADER, STATS_ACTION};
pub use server::GrpcServer;
