//! Versioned metadata snapshot pushed from the leader coordinator to its
//! followers
use rusqlite::params;
use serde::{Deserialize, Serialize};

use silo_rpc::types::*;
use silo_util::error::Error;

use crate::catalog::Catalog;
use crate::error::MetaError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Full copy of the coordinator state: datanode registry, namespace,
/// block catalog and locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
	pub version: u32,
	pub datanodes: Vec<NodeEntry>,
	pub files: Vec<FileEntry>,
	pub blocks: Vec<BlockEntry>,
	pub locations: Vec<BlockLocation>,
}

impl MetadataSnapshot {
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		Ok(rmp_serde::to_vec_named(self)?)
	}

	pub fn decode(buf: &[u8]) -> Result<Self, Error> {
		let snapshot: MetadataSnapshot = rmp_serde::decode::from_read_ref(buf)?;
		if snapshot.version != SNAPSHOT_VERSION {
			return Err(Error::Message(format!(
				"unsupported metadata snapshot version {}",
				snapshot.version
			)));
		}
		Ok(snapshot)
	}
}

impl Catalog {
	/// Serialize the whole catalog. Blocks keep their registration order so
	/// that a follower taking over returns files in the same block order.
	pub fn snapshot(&self) -> Result<MetadataSnapshot, MetaError> {
		let db = self.lock();

		let mut stmt = db.prepare("SELECT * FROM datanodes ORDER BY rowid")?;
		let datanodes = stmt
			.query_map([], crate::catalog::row_to_node)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		let mut stmt = db.prepare("SELECT * FROM files ORDER BY rowid")?;
		let files = stmt
			.query_map([], crate::catalog::row_to_entry)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		let mut stmt = db.prepare("SELECT * FROM blocks ORDER BY rowid")?;
		let blocks = stmt
			.query_map([], crate::catalog::row_to_block)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		let mut stmt =
			db.prepare("SELECT block_id, datanode_id, is_leader FROM block_locations")?;
		let locations = stmt
			.query_map([], |row| {
				Ok(BlockLocation {
					block_id: crate::catalog::get_uuid(row, 0)?,
					node_id: crate::catalog::get_uuid(row, 1)?,
					is_leader: row.get::<_, i64>(2)? != 0,
				})
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		Ok(MetadataSnapshot {
			version: SNAPSHOT_VERSION,
			datanodes,
			files,
			blocks,
			locations,
		})
	}

	/// Apply a snapshot received from the leader, upserting every entry.
	/// Applying the same snapshot twice is a no-op.
	pub fn apply_snapshot(&self, snapshot: &MetadataSnapshot) -> Result<(), MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;

		for n in &snapshot.datanodes {
			tx.execute(
				"INSERT OR REPLACE INTO datanodes (node_id, host, port, status,
					storage_capacity, available_space, last_heartbeat, blocks_stored)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
				params![
					n.node_id.as_slice(),
					n.host,
					n.port as i64,
					match n.status {
						NodeStatus::Active => "active",
						NodeStatus::Inactive => "inactive",
					},
					n.storage_capacity as i64,
					n.available_space as i64,
					n.last_heartbeat as i64,
					n.blocks_stored as i64,
				],
			)?;
		}

		for f in &snapshot.files {
			tx.execute(
				"INSERT OR REPLACE INTO files (file_id, name, path, type, size,
					created_at, modified_at, owner)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
				params![
					f.file_id.as_slice(),
					f.name,
					f.path,
					f.file_type.to_string(),
					f.size as i64,
					f.created_at as i64,
					f.modified_at as i64,
					f.owner,
				],
			)?;
		}

		for b in &snapshot.blocks {
			tx.execute(
				"INSERT OR REPLACE INTO blocks (block_id, file_id, size, checksum)
				 VALUES (?1, ?2, ?3, ?4)",
				params![
					b.block_id.as_slice(),
					b.file_id.as_slice(),
					b.size as i64,
					b.checksum.as_ref().map(|c| c.as_slice().to_vec()),
				],
			)?;
		}

		for l in &snapshot.locations {
			tx.execute(
				"INSERT OR REPLACE INTO block_locations (block_id, datanode_id, is_leader)
				 VALUES (?1, ?2, ?3)",
				params![
					l.block_id.as_slice(),
					l.node_id.as_slice(),
					l.is_leader as i64
				],
			)?;
		}

		tx.commit()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::data::gen_uuid;

	#[test]
	fn test_snapshot_roundtrip_and_convergence() {
		let leader = Catalog::open_in_memory().unwrap();
		leader
			.create_entry("/dir", FileType::Directory, 0, None)
			.unwrap();
		let f = leader
			.create_entry("/dir/f", FileType::File, 8, Some("tester"))
			.unwrap();
		let n = leader.register_node("10.0.0.1", 9000, 1 << 30, 1 << 29).unwrap();
		let b = gen_uuid();
		leader.register_block(b, f.file_id, 8, None).unwrap();
		leader.add_location(b, n.node_id, true).unwrap();

		let encoded = leader.snapshot().unwrap().encode().unwrap();
		let snapshot = MetadataSnapshot::decode(&encoded).unwrap();

		let follower = Catalog::open_in_memory().unwrap();
		follower.apply_snapshot(&snapshot).unwrap();

		let got = follower.get_by_path("/dir/f").unwrap();
		assert_eq!(got.file_id, f.file_id);
		assert_eq!(got.size, 8);
		let blocks = follower.file_blocks(f.file_id, false).unwrap();
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0].locations.len(), 1);
		assert!(blocks[0].locations[0].is_leader);
		assert_eq!(follower.get_node(n.node_id).unwrap().host, "10.0.0.1");

		// applying twice converges to the same state
		follower.apply_snapshot(&snapshot).unwrap();
		assert_eq!(follower.file_blocks(f.file_id, false).unwrap().len(), 1);
		assert_eq!(follower.stats().unwrap().files, 1);
	}

	#[test]
	fn test_decode_rejects_unknown_version() {
		let leader = Catalog::open_in_memory().unwrap();
		let mut snapshot = leader.snapshot().unwrap();
		snapshot.version = 99;
		let encoded = rmp_serde::to_vec_named(&snapshot).unwrap();
		assert!(MetadataSnapshot::decode(&encoded).is_err());
	}
}
