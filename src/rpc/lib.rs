//! Wire types and clients for the three communication planes of Silo:
//! control plane (client/node to coordinator), storage plane (block
//! streaming to datanodes) and peer plane (coordinator to coordinator)

#[macro_use]
extern crate tracing;

pub mod chunk;
pub mod compress;
pub mod messages;
pub mod types;

pub mod coordinator_client;
pub mod datanode_client;
pub mod peer_client;

mod http_helpers;

pub use coordinator_client::CoordinatorClient;
pub use datanode_client::DataNodeClient;
pub use peer_client::PeerClient;
