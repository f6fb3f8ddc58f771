#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod context;
pub mod coordinator;
pub mod helper;
pub mod rpc;
pub mod signaling;
pub mod supervisor;

pub use context::NetworkingContext;
pub use coordinator::PeerBootstrapCoordinator;
pub use rpc::client::RpcClient;
pub use rpc::{ConnectOutcome, ConnectionSession, PeerDescriptor, StunResult};
pub use supervisor::ProcessSupervisor;
