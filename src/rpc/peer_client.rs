//! Client for the coordinator peer plane (election and metadata sync)
use std::net::SocketAddr;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Client, Method};

use silo_util::error::Error;

use crate::http_helpers::*;
use crate::messages::*;

const PEER_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const PEER_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PeerClient {
	client: Client<HttpConnector>,
}

impl Default for PeerClient {
	fn default() -> Self {
		Self::new()
	}
}

impl PeerClient {
	pub fn new() -> Self {
		Self {
			client: Client::new(),
		}
	}

	fn uri(peer: SocketAddr, path: &str) -> String {
		format!("http://{}{}", peer, path)
	}

	pub async fn request_vote(
		&self,
		peer: SocketAddr,
		req: &VoteRequest,
	) -> Result<VoteResponse, Error> {
		let req = msgpack_request(Method::POST, Self::uri(peer, "/peer/vote"), req)?;
		send_msgpack(&self.client, req, PEER_RPC_TIMEOUT).await
	}

	pub async fn heartbeat(
		&self,
		peer: SocketAddr,
		req: &PeerHeartbeatRequest,
	) -> Result<PeerHeartbeatResponse, Error> {
		let req = msgpack_request(Method::POST, Self::uri(peer, "/peer/heartbeat"), req)?;
		send_msgpack(&self.client, req, PEER_RPC_TIMEOUT).await
	}

	pub async fn sync_metadata(
		&self,
		peer: SocketAddr,
		req: &SyncRequest,
	) -> Result<SyncResponse, Error> {
		let req = msgpack_request(Method::POST, Self::uri(peer, "/peer/sync"), req)?;
		send_msgpack(&self.client, req, PEER_SYNC_TIMEOUT).await
	}
}
