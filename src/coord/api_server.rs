//! Control-plane and peer-plane HTTP server of the coordinator
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::Serialize;

use silo_meta::{placement, MetaError};
use silo_rpc::messages::*;
use silo_rpc::types::*;
use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::coordinator::Coordinator;

pub struct ApiServer {
	coordinator: Arc<Coordinator>,
}

impl ApiServer {
	/// Serve the control and peer planes until the shutdown signal resolves
	pub async fn run(
		coordinator: Arc<Coordinator>,
		bind_addr: SocketAddr,
		shutdown_signal: impl Future<Output = ()>,
	) -> Result<(), Error> {
		let server = Arc::new(ApiServer { coordinator });
		let service = make_service_fn(move |_conn: &AddrStream| {
			let server = server.clone();
			async move {
				Ok::<_, Infallible>(service_fn(move |req| {
					let server = server.clone();
					async move { Ok::<_, Infallible>(server.handle_request(req).await) }
				}))
			}
		});

		let http = Server::bind(&bind_addr).serve(service);
		info!("Control plane listening on {}", bind_addr);
		http.with_graceful_shutdown(shutdown_signal).await?;
		Ok(())
	}

	async fn handle_request(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		debug!("{} {}", method, path);

		match self.dispatch(req).await {
			Ok(resp) => resp,
			Err(e) => {
				let status = e.http_status_code();
				if status.is_server_error() {
					warn!("{} {}: {}", method, path, e);
				}
				error_response(status, &e.to_string())
			}
		}
	}

	async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, MetaError> {
		let this = &self.coordinator;
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let query = req.uri().query().map(String::from);

		// routes embedding a namespace path keep their slashes
		if method == Method::GET {
			if let Some(rest) = path.strip_prefix("/files/path") {
				if rest.starts_with('/') {
					let entry = this.catalog.get_by_path(&decode_path(rest)?)?;
					return json_response(StatusCode::OK, &entry);
				}
			}
			if let Some(rest) = path.strip_prefix("/files/info") {
				if rest.starts_with('/') {
					return self.handle_file_info(&decode_path(rest)?);
				}
			}
			if let Some(rest) = path.strip_prefix("/directories") {
				if rest.starts_with('/') {
					let path = decode_path(rest)?;
					let entries = this.catalog.list_directory(&path)?;
					return json_response(StatusCode::OK, &DirectoryListing { path, entries });
				}
			}
		}

		let segments = path
			.split('/')
			.filter(|s| !s.is_empty())
			.map(String::from)
			.collect::<Vec<_>>();

		match (method, segments.as_slice()) {
			// ---- files ----
			(Method::POST, [s]) if s == "files" => {
				self.require_leader()?;
				let body: CreateFileRequest = parse_json(req).await?;
				let entry = this.catalog.create_entry(
					&body.path,
					body.file_type,
					body.size,
					body.owner.as_deref(),
				)?;
				json_response(StatusCode::CREATED, &entry)
			}
			(Method::GET, [s, id]) if s == "files" => {
				let entry = this.catalog.get_by_id(parse_id(id)?)?;
				json_response(StatusCode::OK, &entry)
			}
			(Method::DELETE, [s, id]) if s == "files" => {
				self.require_leader()?;
				let orphans = this.catalog.delete_file(parse_id(id)?)?;
				this.schedule_block_deletion(orphans);
				empty_response(StatusCode::NO_CONTENT)
			}

			// ---- directories ----
			(Method::POST, [s]) if s == "directories" => {
				self.require_leader()?;
				let body: CreateDirectoryRequest = parse_json(req).await?;
				let entry = this.catalog.create_entry(
					&body.path,
					FileType::Directory,
					0,
					body.owner.as_deref(),
				)?;
				json_response(StatusCode::CREATED, &entry)
			}
			(Method::DELETE, [s]) if s == "directories" => {
				self.require_leader()?;
				let body: DeleteDirectoryRequest = parse_json(req).await?;
				let orphans = this.catalog.delete_directory(&body.path, body.recursive)?;
				this.schedule_block_deletion(orphans);
				empty_response(StatusCode::NO_CONTENT)
			}

			// ---- blocks ----
			(Method::POST, [s]) if s == "blocks" => {
				self.require_leader()?;
				let body: RegisterBlockRequest = parse_json(req).await?;
				let block = this.catalog.register_block(
					body.block_id,
					body.file_id,
					body.size,
					body.checksum,
				)?;
				json_response(StatusCode::CREATED, &block)
			}
			(Method::GET, [s, id]) if s == "blocks" => {
				let block = this.catalog.get_block_with_locations(parse_id(id)?)?;
				json_response(StatusCode::OK, &block)
			}
			(Method::PUT, [s, id]) if s == "blocks" => {
				self.require_leader()?;
				let block_id = parse_id(id)?;
				let body: RegisterBlockRequest = parse_json(req).await?;
				let block =
					this.catalog
						.update_block(block_id, Some(body.size), body.checksum)?;
				json_response(StatusCode::OK, &block)
			}
			(Method::POST, [s, id, l]) if s == "blocks" && l == "locations" => {
				self.require_leader()?;
				let block_id = parse_id(id)?;
				let body: AddLocationRequest = parse_json(req).await?;
				this.catalog
					.add_location(block_id, body.node_id, body.is_leader)?;
				empty_response(StatusCode::CREATED)
			}
			(Method::DELETE, [s, id, l, node_id]) if s == "blocks" && l == "locations" => {
				self.require_leader()?;
				this.catalog
					.remove_location(parse_id(id)?, parse_id(node_id)?)?;
				empty_response(StatusCode::NO_CONTENT)
			}

			// ---- placement ----
			(Method::POST, [s]) if s == "placement" => {
				self.require_leader()?;
				let body: PlacementRequest = parse_json(req).await?;
				let nodes = this.catalog.list_nodes(Some(NodeStatus::Active))?;
				let exclude: HashSet<Uuid> = body.exclude.iter().copied().collect();
				let targets = placement::choose_nodes(
					&nodes,
					body.block_size,
					this.replication_factor,
					&exclude,
				)?;
				json_response(StatusCode::OK, &PlacementResponse { targets })
			}

			// ---- datanodes ----
			(Method::POST, [s, r]) if s == "datanodes" && r == "register" => {
				self.require_leader()?;
				let body: RegisterNodeRequest = parse_json(req).await?;
				let node = this.catalog.register_node(
					&body.host,
					body.port,
					body.storage_capacity,
					body.available_space,
				)?;
				json_response(StatusCode::OK, &node)
			}
			(Method::GET, [s]) if s == "datanodes" => {
				let status = match query.as_deref() {
					Some("status=active") => Some(NodeStatus::Active),
					Some("status=inactive") => Some(NodeStatus::Inactive),
					_ => None,
				};
				let nodes = this.catalog.list_nodes(status)?;
				json_response(StatusCode::OK, &nodes)
			}
			(Method::GET, [s, id]) if s == "datanodes" => {
				let node = this.catalog.get_node(parse_id(id)?)?;
				json_response(StatusCode::OK, &node)
			}
			(Method::POST, [s, id, h]) if s == "datanodes" && h == "heartbeat" => {
				self.require_leader()?;
				let node_id = parse_id(id)?;
				let body: HeartbeatRequest = parse_json(req).await?;
				this.catalog
					.heartbeat(node_id, body.available_space, &body.blocks)?;
				empty_response(StatusCode::NO_CONTENT)
			}

			// ---- system ----
			(Method::GET, [s, x]) if s == "system" && x == "stats" => {
				json_response(StatusCode::OK, &this.catalog.stats()?)
			}
			(Method::GET, [s, x]) if s == "system" && x == "balance" => {
				let nodes = this.catalog.list_nodes(Some(NodeStatus::Active))?;
				json_response(
					StatusCode::OK,
					&this.balancer.status(&nodes, this.config.balance_threshold),
				)
			}
			(Method::POST, [s, x]) if s == "system" && x == "balance" => {
				self.require_leader()?;
				let status = this.balancer.run_cycle(this).await?;
				json_response(StatusCode::OK, &status)
			}

			// ---- peer plane ----
			(Method::POST, [s, x]) if s == "peer" && x == "vote" => {
				let body: VoteRequest = parse_msgpack(req).await?;
				msgpack_response(&this.election.handle_vote_request(&body))
			}
			(Method::POST, [s, x]) if s == "peer" && x == "heartbeat" => {
				let body: PeerHeartbeatRequest = parse_msgpack(req).await?;
				msgpack_response(&this.election.handle_heartbeat(&body))
			}
			(Method::POST, [s, x]) if s == "peer" && x == "sync" => {
				let body: SyncRequest = parse_msgpack(req).await?;
				msgpack_response(&this.handle_sync(&body))
			}

			_ => empty_response(StatusCode::NOT_FOUND),
		}
	}

	fn handle_file_info(&self, path: &str) -> Result<Response<Body>, MetaError> {
		let entry = self.coordinator.catalog.get_by_path(path)?;
		let blocks = if entry.is_directory() {
			vec![]
		} else {
			self.coordinator.catalog.file_blocks(entry.file_id, true)?
		};
		json_response(StatusCode::OK, &FileInfo { entry, blocks })
	}

	/// Writes are only accepted by the current leader
	fn require_leader(&self) -> Result<(), MetaError> {
		if self.coordinator.is_leader() {
			return Ok(());
		}
		let hint = match self.coordinator.election.leader_hint() {
			Some(id) => format!("current leader is {:?}", id),
			None => "no leader known".to_string(),
		};
		Err(MetaError::NotLeader(hint))
	}
}

fn parse_id(s: &str) -> Result<Uuid, MetaError> {
	Uuid::from_hex(s).ok_or_else(|| MetaError::BadRequest(format!("invalid identifier: {}", s)))
}

fn decode_path(raw: &str) -> Result<String, MetaError> {
	percent_decode_str(raw)
		.decode_utf8()
		.map(|s| s.into_owned())
		.map_err(|_| MetaError::InvalidPath(raw.to_string()))
}

async fn parse_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, MetaError> {
	let body = hyper::body::to_bytes(req.into_body())
		.await
		.map_err(|e| MetaError::Internal(e.into()))?;
	serde_json::from_slice(&body)
		.map_err(|e| MetaError::BadRequest(format!("invalid request body: {}", e)))
}

async fn parse_msgpack<T: DeserializeOwned>(req: Request<Body>) -> Result<T, MetaError> {
	let body = hyper::body::to_bytes(req.into_body())
		.await
		.map_err(|e| MetaError::Internal(e.into()))?;
	rmp_serde::decode::from_read_ref(&body)
		.map_err(|e| MetaError::BadRequest(format!("invalid request body: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>, MetaError> {
	let body = serde_json::to_vec(body).map_err(|e| MetaError::Internal(e.into()))?;
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.map_err(|e| MetaError::Internal(e.into()))
}

fn msgpack_response<T: Serialize>(body: &T) -> Result<Response<Body>, MetaError> {
	let body = rmp_serde::to_vec_named(body).map_err(|e| MetaError::Internal(e.into()))?;
	Response::builder()
		.status(StatusCode::OK)
		.header(http::header::CONTENT_TYPE, "application/x-msgpack")
		.body(Body::from(body))
		.map_err(|e| MetaError::Internal(e.into()))
}

fn empty_response(status: StatusCode) -> Result<Response<Body>, MetaError> {
	Response::builder()
		.status(status)
		.body(Body::empty())
		.map_err(|e| MetaError::Internal(e.into()))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
	let body = serde_json::to_vec(&ErrorResponse {
		error: message.to_string(),
	})
	.unwrap_or_default();
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.unwrap_or_default()
}
