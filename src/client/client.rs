//! The Silo client: PUT/GET orchestration and namespace operations
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use err_derive::Error;
use futures::stream::{self, StreamExt};
use tokio::io::AsyncWriteExt;

use silo_rpc::messages::*;
use silo_rpc::types::*;
use silo_rpc::{CoordinatorClient, DataNodeClient};
use silo_util::data::{sha256sum, Uuid};
use silo_util::error::Error;

use crate::splitter::{BlockSpec, FileSplitter};

/// Default number of concurrent transfer workers
pub const DEFAULT_WORKERS: usize = 4;
/// Hard cap on the worker pool
pub const MAX_WORKERS: usize = 16;
/// Bounded attempts to store one block, alternate placements included
const UPLOAD_ATTEMPTS: usize = 3;
/// Extra rounds of location refresh for blocks that failed to download
const DOWNLOAD_RETRY_ROUNDS: usize = 2;
/// Per-location deadline when fetching a block
const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Fraction of blocks that must be read to emit a best-effort partial file
const PARTIAL_THRESHOLD: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ClientError {
	#[error(display = "{}", _0)]
	Rpc(#[error(source)] Error),

	#[error(display = "not a file: {}", _0)]
	NotAFile(String),

	#[error(display = "not a directory: {}", _0)]
	NotADirectory(String),

	#[error(display = "upload incomplete, blocks without a confirmed replica: {:?}", missing)]
	UploadIncomplete { file_id: Uuid, missing: Vec<Uuid> },

	#[error(display = "download incomplete, wrote partial file; unreadable blocks: {:?}", missing)]
	DownloadIncomplete { missing: Vec<Uuid> },

	#[error(display = "download failed, unreadable blocks: {:?}", missing)]
	DownloadFailed { missing: Vec<Uuid>, total: usize },
}

/// Outcome of a successful PUT
#[derive(Debug)]
pub struct PutReport {
	pub file_id: Uuid,
	pub file_size: u64,
	pub blocks: usize,
	pub replicas_confirmed: usize,
}

/// Outcome of a successful GET
#[derive(Debug)]
pub struct GetReport {
	pub bytes_written: u64,
	pub blocks: usize,
}

pub struct SiloClient {
	coordinator: CoordinatorClient,
	block_size: usize,
	max_workers: usize,
	block_timeout: Duration,
}

impl SiloClient {
	pub fn new(coordinator_addr: SocketAddr) -> Self {
		Self {
			coordinator: CoordinatorClient::new(coordinator_addr),
			block_size: 4 * 1024 * 1024,
			max_workers: DEFAULT_WORKERS,
			block_timeout: BLOCK_TIMEOUT,
		}
	}

	pub fn with_block_size(mut self, block_size: usize) -> Self {
		self.block_size = block_size;
		self
	}

	pub fn with_workers(mut self, workers: usize) -> Self {
		self.max_workers = workers.clamp(1, MAX_WORKERS);
		self
	}

	pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
		self.block_timeout = timeout;
		self
	}

	pub fn coordinator(&self) -> &CoordinatorClient {
		&self.coordinator
	}

	// ---- PUT ----

	/// Upload a local file to the namespace path `dfs_path`, creating
	/// missing parent directories
	pub async fn put_file(
		&self,
		local_path: &Path,
		dfs_path: &str,
	) -> Result<PutReport, ClientError> {
		let file_size = tokio::fs::metadata(local_path)
			.await
			.map_err(Error::from)?
			.len();

		if let Some(parent) = parent_of(dfs_path) {
			self.ensure_directory_chain(&parent).await?;
		}

		let splitter = FileSplitter::new(self.block_size)?;
		let blocks = splitter.split_file(local_path).await?;
		info!(
			"Uploading {} as {} ({} bytes, {} blocks)",
			local_path.display(),
			dfs_path,
			file_size,
			blocks.len()
		);

		let entry = self
			.coordinator
			.create_file(&CreateFileRequest {
				name: name_of(dfs_path).to_string(),
				path: dfs_path.to_string(),
				file_type: FileType::File,
				size: file_size,
				owner: None,
			})
			.await?;
		let file_id = entry.file_id;

		// registration happens-before any location add for the block, and
		// in index order so the catalog returns blocks in file order
		let mut tasks = vec![];
		for spec in &blocks {
			self.coordinator
				.register_block(&RegisterBlockRequest {
					block_id: spec.block_id,
					file_id,
					size: spec.size,
					checksum: Some(spec.checksum),
				})
				.await?;
			let targets = self
				.coordinator
				.request_placement(&PlacementRequest {
					block_size: spec.size,
					exclude: vec![],
				})
				.await?;
			for target in targets {
				tasks.push((spec.clone(), target));
			}
		}

		// cartesian (block x target) tasks through a bounded pool,
		// leader targets were emitted first for each block
		let results: Vec<(Uuid, bool)> = stream::iter(tasks)
			.map(|(spec, target)| self.upload_one(local_path, spec, target))
			.buffer_unordered(self.max_workers.min(MAX_WORKERS))
			.collect()
			.await;

		let mut confirmed: HashMap<Uuid, usize> = HashMap::new();
		for (block_id, ok) in &results {
			*confirmed.entry(*block_id).or_insert(0) += *ok as usize;
		}
		let missing: Vec<Uuid> = blocks
			.iter()
			.map(|b| b.block_id)
			.filter(|id| confirmed.get(id).copied().unwrap_or(0) == 0)
			.collect();

		if !missing.is_empty() {
			return Err(ClientError::UploadIncomplete { file_id, missing });
		}
		Ok(PutReport {
			file_id,
			file_size,
			blocks: blocks.len(),
			replicas_confirmed: results.iter().filter(|(_, ok)| *ok).count(),
		})
	}

	/// Store one block on one target, falling back to alternate placements
	/// on failure. Returns whether a replica was confirmed.
	async fn upload_one(
		&self,
		local_path: &Path,
		spec: BlockSpec,
		target: PlacementTarget,
	) -> (Uuid, bool) {
		let mut target = target;
		let mut failed_nodes: Vec<Uuid> = vec![];

		for attempt in 0..UPLOAD_ATTEMPTS {
			match self.try_store(local_path, &spec, &target).await {
				Ok(()) => return (spec.block_id, true),
				Err(e) => {
					warn!(
						"Storing block {:?} on {} failed (attempt {}): {}",
						spec.block_id,
						target.node.addr(),
						attempt + 1,
						e
					);
					failed_nodes.push(target.node.node_id);
				}
			}

			if attempt + 1 == UPLOAD_ATTEMPTS {
				break;
			}
			tokio::time::sleep(Duration::from_millis(100 << attempt)).await;

			match self
				.coordinator
				.request_placement(&PlacementRequest {
					block_size: spec.size,
					exclude: failed_nodes.clone(),
				})
				.await
			{
				Ok(alternates) => match alternates.into_iter().next() {
					Some(alt) => {
						// keep the original leader intent: a replacement
						// for the leader target stays the leader
						target = PlacementTarget {
							node: alt.node,
							is_leader: target.is_leader,
						};
					}
					None => break,
				},
				Err(e) => {
					warn!(
						"No alternate placement for block {:?}: {}",
						spec.block_id, e
					);
					break;
				}
			}
		}
		(spec.block_id, false)
	}

	async fn try_store(
		&self,
		local_path: &Path,
		spec: &BlockSpec,
		target: &PlacementTarget,
	) -> Result<(), Error> {
		let data = FileSplitter::read_block(local_path, spec).await?;
		let node = DataNodeClient::new(&target.node.addr());
		let resp = node.store_block(spec.block_id, &data, None).await?;
		if resp.checksum != spec.checksum {
			return Err(Error::CorruptData(spec.checksum));
		}
		self.coordinator
			.add_location(
				spec.block_id,
				&AddLocationRequest {
					node_id: target.node.node_id,
					is_leader: target.is_leader,
				},
			)
			.await?;
		Ok(())
	}

	// ---- GET ----

	/// Download a file to `local_path`, reconstructing it in block order.
	/// When at least 90% of the blocks could be read, a partial file is
	/// produced and `DownloadIncomplete` is returned; below that threshold
	/// the download fails without output.
	pub async fn get_file(
		&self,
		dfs_path: &str,
		local_path: &Path,
	) -> Result<GetReport, ClientError> {
		let info = self.coordinator.get_file_info(dfs_path).await?;
		if info.entry.is_directory() {
			return Err(ClientError::NotAFile(dfs_path.to_string()));
		}

		let total = info.blocks.len();
		let mut fetched: HashMap<Uuid, Bytes> = HashMap::new();

		let results: Vec<(Uuid, Option<Bytes>)> = stream::iter(info.blocks.iter())
			.map(|block| self.download_one(block.clone()))
			.buffer_unordered(self.max_workers.min(MAX_WORKERS))
			.collect()
			.await;
		for (id, data) in results {
			if let Some(data) = data {
				fetched.insert(id, data);
			}
		}

		// failed blocks get fresh location sets from the coordinator; a
		// re-replication may have produced a new live copy in the meantime
		for _round in 0..DOWNLOAD_RETRY_ROUNDS {
			let failed: Vec<Uuid> = info
				.blocks
				.iter()
				.map(|b| b.block.block_id)
				.filter(|id| !fetched.contains_key(id))
				.collect();
			if failed.is_empty() {
				break;
			}
			for block_id in failed {
				match self.coordinator.get_block(block_id).await {
					Ok(fresh) => {
						if let (_, Some(data)) = self.download_one(fresh).await {
							fetched.insert(block_id, data);
						}
					}
					Err(e) => warn!("Refreshing locations of {:?} failed: {}", block_id, e),
				}
			}
		}

		let missing: Vec<Uuid> = info
			.blocks
			.iter()
			.map(|b| b.block.block_id)
			.filter(|id| !fetched.contains_key(id))
			.collect();

		if !missing.is_empty() && total > 0 {
			let got_ratio = fetched.len() as f64 / total as f64;
			if got_ratio < PARTIAL_THRESHOLD {
				return Err(ClientError::DownloadFailed { missing, total });
			}
		}

		let mut out = tokio::fs::File::create(local_path).await.map_err(Error::from)?;
		let mut bytes_written = 0u64;
		for block in &info.blocks {
			match fetched.get(&block.block.block_id) {
				Some(data) => {
					out.write_all(data).await.map_err(Error::from)?;
					bytes_written += data.len() as u64;
				}
				None => {
					// keep offsets aligned in the partial file
					let zeroes = vec![0u8; block.block.size as usize];
					out.write_all(&zeroes).await.map_err(Error::from)?;
				}
			}
		}
		out.sync_all().await.map_err(Error::from)?;

		if !missing.is_empty() {
			return Err(ClientError::DownloadIncomplete { missing });
		}
		Ok(GetReport {
			bytes_written,
			blocks: total,
		})
	}

	/// Fetch one block from its live locations, leader first. A checksum
	/// mismatch counts as a failed location and is reported to the
	/// coordinator so the location can be evicted.
	async fn download_one(&self, block: BlockWithLocations) -> (Uuid, Option<Bytes>) {
		let block_id = block.block.block_id;
		let mut locations: Vec<&LocationInfo> = block
			.locations
			.iter()
			.filter(|l| l.status == NodeStatus::Active)
			.collect();
		locations.sort_by_key(|l| !l.is_leader);

		for loc in locations {
			let node = DataNodeClient::new(&loc.addr());
			let fetched = tokio::time::timeout(self.block_timeout, node.retrieve_block(block_id));
			match fetched.await {
				Ok(Ok(data)) => {
					if let Some(expected) = block.block.checksum {
						if sha256sum(&data) != expected {
							warn!(
								"Checksum mismatch for block {:?} from {}",
								block_id,
								loc.addr()
							);
							if let Err(e) =
								self.coordinator.remove_location(block_id, loc.node_id).await
							{
								debug!("Could not report bad location: {}", e);
							}
							continue;
						}
					}
					return (block_id, Some(data));
				}
				Ok(Err(e)) => {
					warn!("Fetching {:?} from {} failed: {}", block_id, loc.addr(), e);
				}
				Err(_) => {
					warn!("Fetching {:?} from {} timed out", block_id, loc.addr());
				}
			}
		}
		(block_id, None)
	}

	// ---- namespace operations ----

	pub async fn mkdir(&self, path: &str) -> Result<FileEntry, Error> {
		self.coordinator
			.create_directory(&CreateDirectoryRequest {
				path: path.to_string(),
				owner: None,
			})
			.await
	}

	/// Create a directory and all missing ancestors
	pub async fn mkdir_p(&self, path: &str) -> Result<(), ClientError> {
		self.ensure_directory_chain(path).await
	}

	pub async fn ls(&self, path: &str) -> Result<DirectoryListing, Error> {
		self.coordinator.list_directory(path).await
	}

	pub async fn stat(&self, path: &str) -> Result<FileEntry, Error> {
		self.coordinator.get_file_by_path(path).await
	}

	/// Remove a file; block payload cleanup on the storage nodes is
	/// initiated by the coordinator, best-effort
	pub async fn rm(&self, path: &str) -> Result<(), ClientError> {
		let entry = self.coordinator.get_file_by_path(path).await?;
		if entry.is_directory() {
			return Err(ClientError::NotAFile(path.to_string()));
		}
		self.coordinator.delete_file(entry.file_id).await?;
		Ok(())
	}

	pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), Error> {
		self.coordinator
			.delete_directory(&DeleteDirectoryRequest {
				path: path.to_string(),
				recursive,
			})
			.await
	}

	async fn ensure_directory_chain(&self, path: &str) -> Result<(), ClientError> {
		for prefix in ancestor_chain(path) {
			match self.coordinator.get_file_by_path(&prefix).await {
				Ok(entry) if entry.is_directory() => continue,
				Ok(_) => return Err(ClientError::NotADirectory(prefix)),
				Err(e) if e.is_not_found() => {
					match self
						.coordinator
						.create_directory(&CreateDirectoryRequest {
							path: prefix.clone(),
							owner: None,
						})
						.await
					{
						Ok(_) => continue,
						// a concurrent client may have created it first
						Err(Error::Remote(s, _)) if s == http::StatusCode::CONFLICT => continue,
						Err(e) => return Err(e.into()),
					}
				}
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}

fn parent_of(path: &str) -> Option<String> {
	let trimmed = path.trim_end_matches('/');
	match trimmed.rfind('/') {
		Some(0) if trimmed.len() > 1 => Some("/".to_string()),
		Some(i) => Some(trimmed[..i].to_string()),
		_ => None,
	}
}

fn name_of(path: &str) -> &str {
	path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Every ancestor directory of `path` plus the path itself, root-first,
/// root excluded
fn ancestor_chain(path: &str) -> Vec<String> {
	let trimmed = path.trim_end_matches('/');
	let mut out = vec![];
	let mut current = String::new();
	for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
		current = format!("{}/{}", current, segment);
		out.push(current.clone());
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parent_of() {
		assert_eq!(parent_of("/a/b/c"), Some("/a/b".to_string()));
		assert_eq!(parent_of("/a"), Some("/".to_string()));
		assert_eq!(parent_of("/"), None);
	}

	#[test]
	fn test_ancestor_chain() {
		assert_eq!(
			ancestor_chain("/x/y/z"),
			vec!["/x".to_string(), "/x/y".to_string(), "/x/y/z".to_string()]
		);
		assert!(ancestor_chain("/").is_empty());
	}

	#[test]
	fn test_name_of() {
		assert_eq!(name_of("/a/b/hello.txt"), "hello.txt");
		assert_eq!(name_of("/top"), "top");
	}
}
