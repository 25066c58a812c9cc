//! Request and response bodies exchanged on the control, storage and
//! peer planes
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use silo_util::data::{Hash, Uuid};

use crate::types::*;

// ---- control plane: namespace ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
	pub name: String,
	pub path: String,
	#[serde(rename = "type")]
	pub file_type: FileType,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDirectoryRequest {
	pub path: String,
	#[serde(default)]
	pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDirectoryRequest {
	pub path: String,
	#[serde(default)]
	pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryListing {
	pub path: String,
	pub entries: Vec<FileEntry>,
}

/// Extended file metadata: the entry, its ordered blocks and their
/// live locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
	#[serde(flatten)]
	pub entry: FileEntry,
	pub blocks: Vec<BlockWithLocations>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWithLocations {
	#[serde(flatten)]
	pub block: BlockEntry,
	pub locations: Vec<LocationInfo>,
}

// ---- control plane: blocks ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockRequest {
	pub block_id: Uuid,
	pub file_id: Uuid,
	pub size: u64,
	#[serde(default)]
	pub checksum: Option<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLocationRequest {
	pub node_id: Uuid,
	#[serde(default)]
	pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
	pub block_size: u64,
	#[serde(default)]
	pub exclude: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementTarget {
	pub node: NodeEntry,
	pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementResponse {
	pub targets: Vec<PlacementTarget>,
}

// ---- control plane: datanodes ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
	pub host: String,
	pub port: u16,
	pub storage_capacity: u64,
	pub available_space: u64,
}

/// Size and checksum of one block, as reported in heartbeat inventories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReport {
	pub size: u64,
	pub checksum: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
	pub available_space: u64,
	#[serde(default)]
	pub blocks: HashMap<Uuid, BlockReport>,
}

// ---- control plane: system ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
	pub files: u64,
	pub directories: u64,
	pub blocks: u64,
	pub block_bytes: u64,
	pub active_nodes: u64,
	pub inactive_nodes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceStatus {
	pub in_progress: bool,
	pub average_utilization: f64,
	pub utilization_stddev: f64,
	pub is_balanced: bool,
	pub blocks_moved: u64,
	pub last_cycle: Option<u64>,
}

// ---- storage plane ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreBlockResponse {
	pub block_id: Uuid,
	pub size: u64,
	pub checksum: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckBlockResponse {
	pub exists: bool,
	#[serde(default)]
	pub size: Option<u64>,
	#[serde(default)]
	pub checksum: Option<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateBlockRequest {
	pub target: NodeRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStatsReport {
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub compressed_bytes_sent: u64,
	pub compressed_bytes_received: u64,
	pub blocks_compressed: u64,
	pub blocks_plain: u64,
	pub blocks_transferred: u64,
	pub blocks_transfer_failed: u64,
}

// ---- peer plane ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
	pub candidate_id: Uuid,
	pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
	pub vote_granted: bool,
	pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeatRequest {
	pub leader_id: Uuid,
	pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeatResponse {
	pub success: bool,
	pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
	pub source_id: Uuid,
	pub term: u64,
	/// Versioned metadata snapshot, see `silo_meta::snapshot`
	#[serde(with = "serde_bytes")]
	pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
	pub success: bool,
	pub term: u64,
}

/// Uniform error body returned by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: String,
}
