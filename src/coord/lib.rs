//! Coordinator role of Silo: the control-plane API, the failure detector
//! and re-replicator, the load balancer, and leader-follower peer
//! replication with metadata synchronization

#[macro_use]
extern crate tracing;

pub mod api_server;
pub mod balancer;
pub mod coordinator;
pub mod election;
pub mod monitor;
pub mod replicator;
pub mod sync;

pub use api_server::ApiServer;
pub use coordinator::Coordinator;
