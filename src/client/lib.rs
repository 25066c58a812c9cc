//! Client library for Silo: splits files into blocks, orchestrates parallel
//! uploads and downloads with retry and failover, and wraps the namespace
//! operations of the control plane

#[macro_use]
extern crate tracing;

pub mod client;
pub mod splitter;

pub use client::{ClientError, GetReport, PutReport, SiloClient};
pub use splitter::{BlockSpec, FileSplitter};
