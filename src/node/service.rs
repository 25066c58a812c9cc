//! The datanode block service: streaming store/retrieve, integrity checks,
//! deletion, and node-to-node replication and transfer
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;

use silo_rpc::chunk;
use silo_rpc::compress::{self, CompressionAlgorithm};
use silo_rpc::messages::*;
use silo_rpc::{CoordinatorClient, DataNodeClient};
use silo_util::config::{Config, DataNodeConfig};
use silo_util::data::{sha256sum, Uuid};
use silo_util::error::Error;

use crate::manager::BlockStore;
use crate::stats::TransferStats;

pub struct DataNode {
	pub store: Arc<BlockStore>,
	pub stats: TransferStats,
	pub coordinator: CoordinatorClient,
	pub compression: Option<(CompressionAlgorithm, u32)>,
	pub config: DataNodeConfig,

	/// Identity assigned by the coordinator; empty until registration
	/// succeeds
	pub node_id: ArcSwapOption<Uuid>,
}

impl DataNode {
	pub async fn new(config: &Config) -> Result<Arc<Self>, Error> {
		let store = BlockStore::new(config.data_dir.clone()).await?;
		let compression = match &config.datanode.compression_algorithm {
			Some(name) => Some((
				CompressionAlgorithm::from_str(name)?,
				config.datanode.compression_level,
			)),
			None => None,
		};
		Ok(Arc::new(Self {
			store,
			stats: TransferStats::default(),
			coordinator: CoordinatorClient::new(config.datanode.coordinator_addr),
			compression,
			config: config.datanode.clone(),
			node_id: ArcSwapOption::new(None),
		}))
	}

	/// Address announced to the coordinator
	pub fn announced_addr(&self) -> SocketAddr {
		self.config
			.public_addr
			.unwrap_or(self.config.rpc_bind_addr)
	}

	/// Serve the storage plane until the shutdown signal resolves
	pub async fn run(
		self: Arc<Self>,
		bind_addr: SocketAddr,
		shutdown_signal: impl Future<Output = ()>,
	) -> Result<(), Error> {
		let node = self.clone();
		let service = make_service_fn(move |_conn: &AddrStream| {
			let node = node.clone();
			async move {
				Ok::<_, Infallible>(service_fn(move |req| {
					let node = node.clone();
					async move { Ok::<_, Infallible>(node.handle_request(req).await) }
				}))
			}
		});

		let server = Server::bind(&bind_addr).serve(service);
		info!("Block service listening on {}", bind_addr);
		server.with_graceful_shutdown(shutdown_signal).await?;
		Ok(())
	}

	async fn handle_request(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		debug!("{} {}", method, path);

		match self.dispatch(req).await {
			Ok(resp) => resp,
			Err(e) => {
				let status = error_status(&e);
				if status.is_server_error() {
					warn!("{} {}: {}", method, path, e);
				}
				error_response(status, &e)
			}
		}
	}

	async fn dispatch(self: &Arc<Self>, req: Request<Body>) -> Result<Response<Body>, Error> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let segments = path
			.split('/')
			.filter(|s| !s.is_empty())
			.map(String::from)
			.collect::<Vec<_>>();

		match (method, segments.as_slice()) {
			(Method::POST, [b]) if b == "blocks" => self.handle_store(req).await,
			(Method::GET, [b, id]) if b == "blocks" => {
				self.handle_retrieve(parse_id(id)?).await
			}
			(Method::GET, [b, id, i]) if b == "blocks" && i == "info" => {
				self.handle_check(parse_id(id)?).await
			}
			(Method::DELETE, [b, id]) if b == "blocks" => {
				self.handle_delete(parse_id(id)?).await
			}
			(Method::POST, [b, id, op]) if b == "blocks" && op == "replicate" => {
				self.handle_copy_to(parse_id(id)?, req, false).await
			}
			(Method::POST, [b, id, op]) if b == "blocks" && op == "transfer" => {
				self.handle_copy_to(parse_id(id)?, req, true).await
			}
			(Method::GET, [s]) if s == "stats" => {
				json_response(StatusCode::OK, &self.stats.report())
			}
			_ => Ok(Response::builder()
				.status(StatusCode::NOT_FOUND)
				.body(Body::empty())?),
		}
	}

	// ---- handlers ----

	async fn handle_store(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let payload = chunk::collect_frames(req.into_body()).await?;
		let wire_len = payload.data.len() as u64;

		let data = match &payload.compression {
			Some(meta) => {
				let data = compress::decompress(&payload.data, meta)?;
				TransferStats::add(&self.stats.blocks_compressed, 1);
				data
			}
			None => {
				TransferStats::add(&self.stats.blocks_plain, 1);
				payload.data
			}
		};
		TransferStats::add(&self.stats.compressed_bytes_received, wire_len);
		TransferStats::add(&self.stats.bytes_received, data.len() as u64);

		let checksum = self.store.write_block(&payload.block_id, &data).await?;
		debug!(
			"Stored block {:?} ({} bytes)",
			payload.block_id,
			data.len()
		);

		json_response(
			StatusCode::OK,
			&StoreBlockResponse {
				block_id: payload.block_id,
				size: data.len() as u64,
				checksum,
			},
		)
	}

	async fn handle_retrieve(&self, block_id: Uuid) -> Result<Response<Body>, Error> {
		let data = self.store.read_block(&block_id).await?;

		let (wire, meta) = match self.compression {
			Some((algorithm, level)) => compress::compress(&data, algorithm, level)?,
			None => (data.to_vec(), None),
		};
		TransferStats::add(&self.stats.bytes_sent, data.len() as u64);
		TransferStats::add(&self.stats.compressed_bytes_sent, wire.len() as u64);
		TransferStats::add(
			if meta.is_some() {
				&self.stats.blocks_compressed
			} else {
				&self.stats.blocks_plain
			},
			1,
		);

		let frames = chunk::make_frames(block_id, &wire, meta)?;
		Ok(Response::builder()
			.status(StatusCode::OK)
			.header(http::header::CONTENT_TYPE, "application/x-silo-block-stream")
			.body(chunk::frames_to_body(frames))?)
	}

	async fn handle_check(&self, block_id: Uuid) -> Result<Response<Body>, Error> {
		let resp = match self.store.check_block(&block_id).await? {
			Some((size, checksum)) => CheckBlockResponse {
				exists: true,
				size: Some(size),
				checksum: Some(checksum),
			},
			None => CheckBlockResponse {
				exists: false,
				size: None,
				checksum: None,
			},
		};
		json_response(StatusCode::OK, &resp)
	}

	async fn handle_delete(&self, block_id: Uuid) -> Result<Response<Body>, Error> {
		if self.store.delete_block(&block_id).await? {
			debug!("Deleted block {:?}", block_id);
			Ok(Response::builder()
				.status(StatusCode::NO_CONTENT)
				.body(Body::empty())?)
		} else {
			Ok(Response::builder()
				.status(StatusCode::NOT_FOUND)
				.body(Body::empty())?)
		}
	}

	/// Pipe a local block to another datanode and verify the copy. With
	/// `retain`, this is a balancing transfer: the source keeps serving its
	/// copy until the coordinator evicts the location.
	async fn handle_copy_to(
		&self,
		block_id: Uuid,
		req: Request<Body>,
		retain: bool,
	) -> Result<Response<Body>, Error> {
		let body = hyper::body::to_bytes(req.into_body()).await?;
		let r: ReplicateBlockRequest = serde_json::from_slice(&body)?;

		let data = self.store.read_block(&block_id).await?;
		let local_checksum = sha256sum(&data);

		let result = self
			.copy_block_to(block_id, &data, local_checksum, &r.target)
			.await;
		match result {
			Ok(()) => {
				TransferStats::add(&self.stats.blocks_transferred, 1);
				info!(
					"Block {:?} {} to {:?} at {}",
					block_id,
					if retain { "transferred" } else { "replicated" },
					r.target.node_id,
					r.target.addr(),
				);
				Ok(Response::builder()
					.status(StatusCode::OK)
					.body(Body::empty())?)
			}
			Err(e) => {
				TransferStats::add(&self.stats.blocks_transfer_failed, 1);
				Err(e)
			}
		}
	}

	async fn copy_block_to(
		&self,
		block_id: Uuid,
		data: &[u8],
		local_checksum: silo_util::data::Hash,
		target: &silo_rpc::types::NodeRef,
	) -> Result<(), Error> {
		let client = DataNodeClient::new(&target.addr());
		client.store_block(block_id, data, self.compression).await?;

		// Integrity check on the copy is a hard requirement, a replica with
		// a different checksum must never be registered
		let status = client.check_block(block_id).await?;
		if !status.exists || status.checksum != Some(local_checksum) {
			return Err(Error::Message(format!(
				"replica of {:?} on {} failed checksum verification",
				block_id,
				target.addr()
			)));
		}
		Ok(())
	}
}

fn parse_id(s: &str) -> Result<Uuid, Error> {
	Uuid::from_hex(s).ok_or_else(|| Error::Message(format!("invalid block id: {}", s)))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>, Error> {
	Ok(Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(serde_json::to_vec(body)?))?)
}

fn error_status(e: &Error) -> StatusCode {
	match e {
		Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
		Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
		Error::Remote(_, _) => StatusCode::BAD_GATEWAY,
		Error::Json(_) | Error::Message(_) => StatusCode::BAD_REQUEST,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

fn error_response(status: StatusCode, e: &Error) -> Response<Body> {
	let body = serde_json::to_vec(&ErrorResponse {
		error: e.to_string(),
	})
	.unwrap_or_default();
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.unwrap_or_default()
}
