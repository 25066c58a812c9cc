//! Typed client for the storage plane of a datanode
use std::time::Duration;

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{Client, Method, Request};

use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::chunk;
use crate::compress::{self, CompressionAlgorithm};
use crate::http_helpers::*;
use crate::messages::*;
use crate::types::NodeRef;

/// Default deadline for a whole-block transfer
pub const BLOCK_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DataNodeClient {
	client: Client<HttpConnector>,
	base: String,
	timeout: Duration,
}

impl DataNodeClient {
	/// `addr` is a `host:port` pair
	pub fn new(addr: &str) -> Self {
		Self {
			client: Client::new(),
			base: format!("http://{}", addr),
			timeout: BLOCK_TRANSFER_TIMEOUT,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	fn uri(&self, path: &str) -> String {
		format!("{}{}", self.base, path)
	}

	/// Stream a block payload to the node. The payload is compressed
	/// before chunking when an algorithm is given and it is worthwhile.
	pub async fn store_block(
		&self,
		block_id: Uuid,
		payload: &[u8],
		compression: Option<(CompressionAlgorithm, u32)>,
	) -> Result<StoreBlockResponse, Error> {
		let (wire, meta) = match compression {
			Some((algorithm, level)) => compress::compress(payload, algorithm, level)?,
			None => (payload.to_vec(), None),
		};
		let frames = chunk::make_frames(block_id, &wire, meta)?;
		let req = Request::builder()
			.method(Method::POST)
			.uri(self.uri("/blocks"))
			.body(chunk::frames_to_body(frames))?;
		send_json(&self.client, req, self.timeout).await
	}

	/// Fetch a whole block, reassembling and decompressing the stream
	pub async fn retrieve_block(&self, block_id: Uuid) -> Result<Bytes, Error> {
		let req = empty_request(Method::GET, self.uri(&format!("/blocks/{}", block_id)))?;
		let resp = send(&self.client, req, self.timeout).await?;
		let payload = chunk::collect_frames(resp.into_body()).await?;
		if payload.block_id != block_id {
			return Err(Error::Message(format!(
				"node returned block {:?} instead of {:?}",
				payload.block_id, block_id
			)));
		}
		let data = match &payload.compression {
			Some(meta) => compress::decompress(&payload.data, meta)?,
			None => payload.data,
		};
		Ok(data.into())
	}

	pub async fn check_block(&self, block_id: Uuid) -> Result<CheckBlockResponse, Error> {
		let req = empty_request(
			Method::GET,
			self.uri(&format!("/blocks/{}/info", block_id)),
		)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn delete_block(&self, block_id: Uuid) -> Result<(), Error> {
		let req = empty_request(Method::DELETE, self.uri(&format!("/blocks/{}", block_id)))?;
		send_unit(&self.client, req, self.timeout).await
	}

	/// Ask the node to copy one of its blocks to `target` and verify the
	/// copy's checksum
	pub async fn replicate_block(&self, block_id: Uuid, target: NodeRef) -> Result<(), Error> {
		let body = ReplicateBlockRequest { target };
		let req = json_request(
			Method::POST,
			self.uri(&format!("/blocks/{}/replicate", block_id)),
			&body,
		)?;
		send_unit(&self.client, req, self.timeout).await
	}

	/// Same as replicate, for balancing moves: the source keeps its copy
	/// until the coordinator evicts the location
	pub async fn transfer_block(&self, block_id: Uuid, target: NodeRef) -> Result<(), Error> {
		let body = ReplicateBlockRequest { target };
		let req = json_request(
			Method::POST,
			self.uri(&format!("/blocks/{}/transfer", block_id)),
			&body,
		)?;
		send_unit(&self.client, req, self.timeout).await
	}

	pub async fn transfer_stats(&self) -> Result<TransferStatsReport, Error> {
		let req = empty_request(Method::GET, self.uri("/stats"))?;
		send_json(&self.client, req, self.timeout).await
	}
}
