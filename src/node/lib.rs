//! Storage node role: local content-addressed block store, streaming block
//! service, and the registration/heartbeat lifecycle against the coordinator

#[macro_use]
extern crate tracing;

pub mod manager;
pub mod registration;
pub mod service;
pub mod stats;

pub use manager::BlockStore;
pub use service::DataNode;
