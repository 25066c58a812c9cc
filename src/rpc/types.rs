//! Record types for the entities tracked by the coordinator
use serde::{Deserialize, Serialize};

use silo_util::data::{Hash, Uuid};

/// Kind of a namespace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
	File,
	Directory,
}

impl std::fmt::Display for FileType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FileType::File => write!(f, "file"),
			FileType::Directory => write!(f, "directory"),
		}
	}
}

/// Liveness status of a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
	Active,
	Inactive,
}

/// A namespace entry: a file or a directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
	pub file_id: Uuid,
	pub name: String,
	pub path: String,
	#[serde(rename = "type")]
	pub file_type: FileType,
	pub size: u64,
	pub created_at: u64,
	pub modified_at: u64,
	pub owner: Option<String>,
}

impl FileEntry {
	pub fn is_directory(&self) -> bool {
		self.file_type == FileType::Directory
	}
}

/// An immutable byte-range of a file, the unit of placement and transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
	pub block_id: Uuid,
	pub file_id: Uuid,
	pub size: u64,
	pub checksum: Option<Hash>,
}

/// The presence of a block on a given storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocation {
	pub block_id: Uuid,
	pub node_id: Uuid,
	pub is_leader: bool,
}

/// A registered storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
	pub node_id: Uuid,
	pub host: String,
	pub port: u16,
	pub status: NodeStatus,
	pub storage_capacity: u64,
	pub available_space: u64,
	pub last_heartbeat: u64,
	pub blocks_stored: u64,
}

impl NodeEntry {
	/// Address of the node's block service
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Fraction of the node's capacity in use, between 0 and 1
	pub fn utilization(&self) -> f64 {
		if self.storage_capacity == 0 {
			return 0.0;
		}
		let used = self.storage_capacity.saturating_sub(self.available_space);
		used as f64 / self.storage_capacity as f64
	}
}

/// A block location joined with the address of the node holding it,
/// as returned by the control plane for reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
	pub node_id: Uuid,
	pub is_leader: bool,
	pub host: String,
	pub port: u16,
	pub status: NodeStatus,
}

impl LocationInfo {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

/// Identity of a replication target, as passed to replicate/transfer calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
	pub node_id: Uuid,
	pub host: String,
	pub port: u16,
}

impl NodeRef {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl From<&NodeEntry> for NodeRef {
	fn from(n: &NodeEntry) -> NodeRef {
		NodeRef {
			node_id: n.node_id,
			host: n.host.clone(),
			port: n.port,
		}
	}
}

impl From<&LocationInfo> for NodeRef {
	fn from(l: &LocationInfo) -> NodeRef {
		NodeRef {
			node_id: l.node_id,
			host: l.host.clone(),
			port: l.port,
		}
	}
}

/// Role of a coordinator in the current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
	Leader,
	Follower,
	Candidate,
}
