//! Contains type and functions related to Silo configuration file
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where to store metadata (coordinator catalog). Should be fast,
	/// but low volume
	pub metadata_dir: PathBuf,
	/// Path where to store block data. Can be slower, but need higher volume
	pub data_dir: PathBuf,

	/// Size of data blocks files are partitioned into
	#[serde(default = "default_block_size")]
	pub block_size: usize,

	/// Number of locations each block should be stored at
	#[serde(default = "default_replication_factor")]
	pub replication_factor: usize,

	/// Configuration for the coordinator role
	#[serde(default)]
	pub coordinator: CoordinatorConfig,

	/// Configuration for the storage node role
	#[serde(default)]
	pub datanode: DataNodeConfig,
}

/// Configuration for the coordinator role
#[derive(Deserialize, Debug, Clone)]
pub struct CoordinatorConfig {
	/// Address and port to bind for the control plane and peer plane
	#[serde(default = "default_api_bind_addr")]
	pub api_bind_addr: SocketAddr,

	/// Address advertised to peer coordinators
	pub public_addr: Option<SocketAddr>,

	/// Addresses of the other coordinators of the cluster
	#[serde(default)]
	pub known_peers: Vec<SocketAddr>,

	/// Interval between two scans of the datanode registry (seconds)
	#[serde(default = "default_detector_interval")]
	pub detector_interval: u64,
	/// Time without heartbeat after which an active datanode is
	/// marked inactive (seconds)
	#[serde(default = "default_heartbeat_timeout")]
	pub heartbeat_timeout: u64,
	/// Time without heartbeat after which an inactive datanode is
	/// evicted from the registry (seconds)
	#[serde(default = "default_eviction_timeout")]
	pub eviction_timeout: u64,

	/// Time without leader heartbeat before starting an election (seconds)
	#[serde(default = "default_election_timeout")]
	pub election_timeout: u64,
	/// Interval between two leader heartbeats (seconds)
	#[serde(default = "default_peer_heartbeat_interval")]
	pub peer_heartbeat_interval: u64,
	/// Interval between two metadata snapshot pushes (seconds)
	#[serde(default = "default_sync_interval")]
	pub sync_interval: u64,

	/// Whether the background load balancer is enabled
	#[serde(default = "default_true")]
	pub auto_balance: bool,
	/// Interval between two balancing cycles (seconds)
	#[serde(default = "default_balance_interval")]
	pub balance_interval: u64,
	/// Allowed deviation of per-node utilization around the mean
	#[serde(default = "default_balance_threshold")]
	pub balance_threshold: f64,
}

/// Configuration for the storage node role
#[derive(Deserialize, Debug, Clone)]
pub struct DataNodeConfig {
	/// Address and port to bind for the block service
	#[serde(default = "default_rpc_bind_addr")]
	pub rpc_bind_addr: SocketAddr,

	/// Address advertised to the coordinator; defaults to the bind address
	pub public_addr: Option<SocketAddr>,

	/// Address of the coordinator control plane
	#[serde(default = "default_api_bind_addr")]
	pub coordinator_addr: SocketAddr,

	/// Interval between two heartbeats to the coordinator (seconds)
	#[serde(default = "default_node_heartbeat_interval")]
	pub heartbeat_interval: u64,

	/// Storage capacity announced to the coordinator (bytes); when absent,
	/// the capacity of the filesystem holding the data directory is used
	pub storage_capacity: Option<u64>,

	/// Compression algorithm applied to block transfers ("zlib" or "lzma");
	/// when absent, blocks are transferred uncompressed
	pub compression_algorithm: Option<String>,
	/// Compression level (1 to 9)
	#[serde(default = "default_compression_level")]
	pub compression_level: u32,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		CoordinatorConfig {
			api_bind_addr: default_api_bind_addr(),
			public_addr: None,
			known_peers: vec![],
			detector_interval: default_detector_interval(),
			heartbeat_timeout: default_heartbeat_timeout(),
			eviction_timeout: default_eviction_timeout(),
			election_timeout: default_election_timeout(),
			peer_heartbeat_interval: default_peer_heartbeat_interval(),
			sync_interval: default_sync_interval(),
			auto_balance: true,
			balance_interval: default_balance_interval(),
			balance_threshold: default_balance_threshold(),
		}
	}
}

impl Default for DataNodeConfig {
	fn default() -> Self {
		DataNodeConfig {
			rpc_bind_addr: default_rpc_bind_addr(),
			public_addr: None,
			coordinator_addr: default_api_bind_addr(),
			heartbeat_interval: default_node_heartbeat_interval(),
			storage_capacity: None,
			compression_algorithm: None,
			compression_level: default_compression_level(),
		}
	}
}

fn default_block_size() -> usize {
	4 * 1024 * 1024
}
fn default_replication_factor() -> usize {
	3
}
fn default_api_bind_addr() -> SocketAddr {
	"127.0.0.1:3900".parse().unwrap()
}
fn default_rpc_bind_addr() -> SocketAddr {
	"127.0.0.1:3901".parse().unwrap()
}
fn default_detector_interval() -> u64 {
	10
}
fn default_heartbeat_timeout() -> u64 {
	60
}
fn default_eviction_timeout() -> u64 {
	2 * 3600
}
fn default_election_timeout() -> u64 {
	5
}
fn default_peer_heartbeat_interval() -> u64 {
	1
}
fn default_sync_interval() -> u64 {
	5
}
fn default_balance_interval() -> u64 {
	300
}
fn default_balance_threshold() -> f64 {
	0.2
}
fn default_node_heartbeat_interval() -> u64 {
	10
}
fn default_compression_level() -> u32 {
	5
}
fn default_true() -> bool {
	true
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_minimal() {
		let config: Config = toml::from_str(
			r#"
			metadata_dir = "/tmp/silo/meta"
			data_dir = "/tmp/silo/data"
			"#,
		)
		.unwrap();
		assert_eq!(config.block_size, 4 * 1024 * 1024);
		assert_eq!(config.replication_factor, 3);
		assert_eq!(config.coordinator.heartbeat_timeout, 60);
		assert_eq!(config.datanode.heartbeat_interval, 10);
	}

	#[test]
	fn test_parse_sections() {
		let config: Config = toml::from_str(
			r#"
			metadata_dir = "/tmp/silo/meta"
			data_dir = "/tmp/silo/data"
			block_size = 4096
			replication_factor = 2

			[coordinator]
			api_bind_addr = "0.0.0.0:8000"
			known_peers = ["10.0.0.2:8000", "10.0.0.3:8000"]

			[datanode]
			rpc_bind_addr = "0.0.0.0:9000"
			coordinator_addr = "10.0.0.1:8000"
			compression_algorithm = "zlib"
			"#,
		)
		.unwrap();
		assert_eq!(config.block_size, 4096);
		assert_eq!(config.coordinator.known_peers.len(), 2);
		assert_eq!(
			config.datanode.compression_algorithm.as_deref(),
			Some("zlib")
		);
	}
}
