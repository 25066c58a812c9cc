//! Metadata plane of the Silo coordinator: the sqlite-backed catalog of
//! files, blocks, locations and datanodes, the block placement policy and
//! the snapshot format used for follower synchronization

#[macro_use]
extern crate tracing;

pub mod catalog;
pub mod error;
pub mod placement;
pub mod snapshot;

pub use catalog::Catalog;
pub use error::MetaError;
