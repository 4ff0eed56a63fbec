//! Agent RPC: the transport the installer and updater use to run commands on
//! remote nodes and observe their liveness.

pub mod backoff;
pub mod client;
pub mod group;
pub mod server;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("agent");
}

pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff, StopBackoff};
pub use client::{AgentClient, Credentials};
pub use group::{AgentGroup, AgentGroupConfig, AgentHandle, Peer, ReconnectStrategy, WatchEvent};
pub use server::{AgentServer, AgentServerConfig, CommandExecutor, LocalExecutor};
