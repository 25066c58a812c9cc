//! Typed client for the coordinator control plane
use std::net::SocketAddr;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Client, Method};

use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::http_helpers::*;
use crate::messages::*;
use crate::types::*;

pub struct CoordinatorClient {
	client: Client<HttpConnector>,
	base: String,
	timeout: Duration,
}

impl CoordinatorClient {
	pub fn new(addr: SocketAddr) -> Self {
		Self {
			client: Client::new(),
			base: format!("http://{}", addr),
			timeout: DEFAULT_RPC_TIMEOUT,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	fn uri(&self, path: &str) -> String {
		format!("{}{}", self.base, path)
	}

	// ---- files ----

	pub async fn create_file(&self, req: &CreateFileRequest) -> Result<FileEntry, Error> {
		let req = json_request(Method::POST, self.uri("/files"), req)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn get_file(&self, file_id: Uuid) -> Result<FileEntry, Error> {
		let req = empty_request(Method::GET, self.uri(&format!("/files/{}", file_id)))?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn delete_file(&self, file_id: Uuid) -> Result<(), Error> {
		let req = empty_request(Method::DELETE, self.uri(&format!("/files/{}", file_id)))?;
		send_unit(&self.client, req, self.timeout).await
	}

	pub async fn get_file_by_path(&self, path: &str) -> Result<FileEntry, Error> {
		let req = empty_request(
			Method::GET,
			self.uri(&format!("/files/path{}", encode_path(path))),
		)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, Error> {
		let req = empty_request(
			Method::GET,
			self.uri(&format!("/files/info{}", encode_path(path))),
		)?;
		send_json(&self.client, req, self.timeout).await
	}

	// ---- directories ----

	pub async fn create_directory(&self, req: &CreateDirectoryRequest) -> Result<FileEntry, Error> {
		let req = json_request(Method::POST, self.uri("/directories"), req)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn delete_directory(&self, req: &DeleteDirectoryRequest) -> Result<(), Error> {
		let req = json_request(Method::DELETE, self.uri("/directories"), req)?;
		send_unit(&self.client, req, self.timeout).await
	}

	pub async fn list_directory(&self, path: &str) -> Result<DirectoryListing, Error> {
		let req = empty_request(
			Method::GET,
			self.uri(&format!("/directories{}", encode_path(path))),
		)?;
		send_json(&self.client, req, self.timeout).await
	}

	// ---- blocks ----

	pub async fn register_block(&self, req: &RegisterBlockRequest) -> Result<BlockEntry, Error> {
		let req = json_request(Method::POST, self.uri("/blocks"), req)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn get_block(&self, block_id: Uuid) -> Result<BlockWithLocations, Error> {
		let req = empty_request(Method::GET, self.uri(&format!("/blocks/{}", block_id)))?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn add_location(
		&self,
		block_id: Uuid,
		req: &AddLocationRequest,
	) -> Result<(), Error> {
		let req = json_request(
			Method::POST,
			self.uri(&format!("/blocks/{}/locations", block_id)),
			req,
		)?;
		send_unit(&self.client, req, self.timeout).await
	}

	pub async fn remove_location(&self, block_id: Uuid, node_id: Uuid) -> Result<(), Error> {
		let req = empty_request(
			Method::DELETE,
			self.uri(&format!("/blocks/{}/locations/{}", block_id, node_id)),
		)?;
		send_unit(&self.client, req, self.timeout).await
	}

	pub async fn request_placement(
		&self,
		req: &PlacementRequest,
	) -> Result<Vec<PlacementTarget>, Error> {
		let req = json_request(Method::POST, self.uri("/placement"), req)?;
		let resp: PlacementResponse = send_json(&self.client, req, self.timeout).await?;
		Ok(resp.targets)
	}

	// ---- datanodes ----

	pub async fn register_node(&self, req: &RegisterNodeRequest) -> Result<NodeEntry, Error> {
		let req = json_request(Method::POST, self.uri("/datanodes/register"), req)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn list_nodes(&self, status: Option<NodeStatus>) -> Result<Vec<NodeEntry>, Error> {
		let uri = match status {
			Some(NodeStatus::Active) => self.uri("/datanodes?status=active"),
			Some(NodeStatus::Inactive) => self.uri("/datanodes?status=inactive"),
			None => self.uri("/datanodes"),
		};
		let req = empty_request(Method::GET, uri)?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn get_node(&self, node_id: Uuid) -> Result<NodeEntry, Error> {
		let req = empty_request(Method::GET, self.uri(&format!("/datanodes/{}", node_id)))?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn heartbeat(&self, node_id: Uuid, req: &HeartbeatRequest) -> Result<(), Error> {
		let req = json_request(
			Method::POST,
			self.uri(&format!("/datanodes/{}/heartbeat", node_id)),
			req,
		)?;
		send_unit(&self.client, req, self.timeout).await
	}

	// ---- system ----

	pub async fn system_stats(&self) -> Result<SystemStats, Error> {
		let req = empty_request(Method::GET, self.uri("/system/stats"))?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn trigger_balance(&self) -> Result<BalanceStatus, Error> {
		let req = empty_request(Method::POST, self.uri("/system/balance"))?;
		send_json(&self.client, req, self.timeout).await
	}

	pub async fn balance_status(&self) -> Result<BalanceStatus, Error> {
		let req = empty_request(Method::GET, self.uri("/system/balance"))?;
		send_json(&self.client, req, self.timeout).await
	}
}
