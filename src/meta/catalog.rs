//! The coordinator's authoritative state: a sqlite-backed catalog of the
//! namespace, the block registry and the datanode registry
//!
//! Every mutating operation runs in its own transaction; the connection is
//! behind a mutex, which makes the catalog a single-writer store as required
//! by the leader-only write model.
use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use silo_rpc::messages::{BlockReport, BlockWithLocations, SystemStats};
use silo_rpc::types::*;
use silo_util::data::{gen_uuid, Hash, Uuid};
use silo_util::time::now_msec;

use crate::error::MetaError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS datanodes (
	node_id BLOB PRIMARY KEY,
	host TEXT NOT NULL,
	port INTEGER NOT NULL,
	status TEXT NOT NULL DEFAULT 'active',
	storage_capacity INTEGER NOT NULL,
	available_space INTEGER NOT NULL,
	last_heartbeat INTEGER NOT NULL,
	blocks_stored INTEGER NOT NULL DEFAULT 0,
	UNIQUE (host, port)
);
CREATE TABLE IF NOT EXISTS files (
	file_id BLOB PRIMARY KEY,
	name TEXT NOT NULL,
	path TEXT NOT NULL UNIQUE,
	type TEXT NOT NULL,
	size INTEGER NOT NULL DEFAULT 0,
	created_at INTEGER NOT NULL,
	modified_at INTEGER NOT NULL,
	owner TEXT
);
CREATE TABLE IF NOT EXISTS blocks (
	block_id BLOB PRIMARY KEY,
	file_id BLOB NOT NULL,
	size INTEGER NOT NULL DEFAULT 0,
	checksum BLOB,
	FOREIGN KEY (file_id) REFERENCES files (file_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS block_locations (
	block_id BLOB NOT NULL,
	datanode_id BLOB NOT NULL,
	is_leader INTEGER NOT NULL DEFAULT 0,
	PRIMARY KEY (block_id, datanode_id),
	FOREIGN KEY (block_id) REFERENCES blocks (block_id) ON DELETE CASCADE,
	FOREIGN KEY (datanode_id) REFERENCES datanodes (node_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_files_path ON files (path);
CREATE INDEX IF NOT EXISTS idx_blocks_file_id ON blocks (file_id);
CREATE INDEX IF NOT EXISTS idx_block_locations_block_id ON block_locations (block_id);
CREATE INDEX IF NOT EXISTS idx_block_locations_datanode_id ON block_locations (datanode_id);
"#;

/// Blocks deleted together with a namespace entry, with the nodes that held
/// them; used for best-effort payload deletion on the storage nodes
pub type OrphanedBlocks = Vec<(Uuid, Vec<NodeRef>)>;

pub struct Catalog {
	db: Mutex<Connection>,
}

impl Catalog {
	/// Open (or create) the catalog under the given metadata directory,
	/// ensuring the root directory row exists
	pub fn open(metadata_dir: &Path) -> Result<Self, MetaError> {
		std::fs::create_dir_all(metadata_dir).map_err(silo_util::error::Error::from)?;
		let db_path = metadata_dir.join("catalog.db");
		let db = Connection::open(&db_path)?;
		db.execute_batch(SCHEMA)?;

		let catalog = Catalog { db: Mutex::new(db) };
		catalog.ensure_root()?;
		info!("Catalog opened at {}", db_path.display());
		Ok(catalog)
	}

	/// In-memory catalog, used by tests and follower bootstrap checks
	pub fn open_in_memory() -> Result<Self, MetaError> {
		let db = Connection::open_in_memory()?;
		db.execute_batch(SCHEMA)?;
		let catalog = Catalog { db: Mutex::new(db) };
		catalog.ensure_root()?;
		Ok(catalog)
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
		self.db.lock().expect("catalog mutex poisoned")
	}

	fn ensure_root(&self) -> Result<(), MetaError> {
		let db = self.lock();
		let existing: Option<i64> = db
			.query_row("SELECT 1 FROM files WHERE path = '/'", [], |r| r.get(0))
			.optional()?;
		if existing.is_none() {
			let now = now_msec() as i64;
			db.execute(
				"INSERT INTO files (file_id, name, path, type, size, created_at, modified_at, owner)
				 VALUES (?1, '', '/', 'directory', 0, ?2, ?2, 'system')",
				params![gen_uuid().as_slice(), now],
			)?;
			info!("Created root directory entry");
		}
		Ok(())
	}

	// ---- namespace ----

	/// Create a file or directory entry. Atomic: the parent check and the
	/// insertion happen in the same transaction.
	pub fn create_entry(
		&self,
		path: &str,
		file_type: FileType,
		size: u64,
		owner: Option<&str>,
	) -> Result<FileEntry, MetaError> {
		let path = normalize_path(path)?;
		if path == "/" {
			return Err(MetaError::AlreadyExists("/".into()));
		}
		let parent = parent_path(&path).expect("non-root path has a parent");
		let name = entry_name(&path).to_string();

		let mut db = self.lock();
		let tx = db.transaction()?;

		if row_to_entry_opt(&tx, "SELECT * FROM files WHERE path = ?1", &path)?.is_some() {
			return Err(MetaError::AlreadyExists(path));
		}
		match row_to_entry_opt(&tx, "SELECT * FROM files WHERE path = ?1", parent)? {
			None => return Err(MetaError::ParentMissing(parent.to_string())),
			Some(p) if !p.is_directory() => {
				return Err(MetaError::ParentNotDirectory(parent.to_string()))
			}
			Some(_) => (),
		}
		if file_type == FileType::Directory && size != 0 {
			return Err(MetaError::BadRequest("directory size must be zero".into()));
		}

		let entry = FileEntry {
			file_id: gen_uuid(),
			name,
			path: path.clone(),
			file_type,
			size,
			created_at: now_msec(),
			modified_at: now_msec(),
			owner: owner.map(String::from),
		};
		tx.execute(
			"INSERT INTO files (file_id, name, path, type, size, created_at, modified_at, owner)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
			params![
				entry.file_id.as_slice(),
				entry.name,
				entry.path,
				entry.file_type.to_string(),
				entry.size as i64,
				entry.created_at as i64,
				entry.modified_at as i64,
				entry.owner,
			],
		)?;
		tx.commit()?;
		Ok(entry)
	}

	pub fn get_by_id(&self, file_id: Uuid) -> Result<FileEntry, MetaError> {
		let db = self.lock();
		entry_by_id(&db, file_id)
	}

	pub fn get_by_path(&self, path: &str) -> Result<FileEntry, MetaError> {
		let path = normalize_path(path)?;
		let db = self.lock();
		row_to_entry_opt(&db, "SELECT * FROM files WHERE path = ?1", &path)?
			.ok_or(MetaError::NoSuchEntry(path))
	}

	/// Direct children of a directory
	pub fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>, MetaError> {
		let path = normalize_path(path)?;
		let db = self.lock();
		let dir = row_to_entry_opt(&db, "SELECT * FROM files WHERE path = ?1", &path)?
			.ok_or_else(|| MetaError::NoSuchEntry(path.clone()))?;
		if !dir.is_directory() {
			return Err(MetaError::NotDirectory(path));
		}

		let prefix = if path == "/" {
			"/".to_string()
		} else {
			format!("{}/", path)
		};
		let like = format!("{}%", escape_like(&prefix));
		let not_like = format!("{}%/%", escape_like(&prefix));
		let mut stmt = db.prepare(
			"SELECT * FROM files
			 WHERE path LIKE ?1 ESCAPE '\\' AND path NOT LIKE ?2 ESCAPE '\\' AND path != '/'",
		)?;
		let entries = stmt
			.query_map(params![like, not_like], row_to_entry)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(entries)
	}

	/// Delete a file entry with its blocks and locations. Returns what was
	/// orphaned so the caller can schedule payload deletion.
	pub fn delete_file(&self, file_id: Uuid) -> Result<OrphanedBlocks, MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;

		let entry = entry_by_id(&tx, file_id)?;
		if entry.is_directory() {
			return Err(MetaError::IsDirectory(entry.path));
		}

		let orphans = delete_file_rows(&tx, file_id)?;
		tx.execute("DELETE FROM files WHERE file_id = ?1", params![file_id.as_slice()])?;
		refresh_block_counts(&tx)?;
		tx.commit()?;
		Ok(orphans)
	}

	/// Delete a directory. Without `recursive` the directory must be empty;
	/// with it, all descendants go away in the same transaction, files
	/// first, then directories bottom-up.
	pub fn delete_directory(
		&self,
		path: &str,
		recursive: bool,
	) -> Result<OrphanedBlocks, MetaError> {
		let path = normalize_path(path)?;
		if path == "/" {
			return Err(MetaError::BadRequest("cannot remove the root directory".into()));
		}

		let mut db = self.lock();
		let tx = db.transaction()?;

		let dir = row_to_entry_opt(&tx, "SELECT * FROM files WHERE path = ?1", &path)?
			.ok_or_else(|| MetaError::NoSuchEntry(path.clone()))?;
		if !dir.is_directory() {
			return Err(MetaError::NotDirectory(path));
		}

		let prefix_like = format!("{}/%", escape_like(&path));
		let mut stmt = tx.prepare(
			"SELECT * FROM files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY length(path) DESC",
		)?;
		let descendants = stmt
			.query_map(params![prefix_like], row_to_entry)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		if !recursive && !descendants.is_empty() {
			return Err(MetaError::DirectoryNotEmpty(path));
		}

		let mut orphans = vec![];
		for entry in &descendants {
			if !entry.is_directory() {
				orphans.extend(delete_file_rows(&tx, entry.file_id)?);
			}
			tx.execute(
				"DELETE FROM files WHERE file_id = ?1",
				params![entry.file_id.as_slice()],
			)?;
		}
		tx.execute("DELETE FROM files WHERE file_id = ?1", params![dir.file_id.as_slice()])?;
		refresh_block_counts(&tx)?;
		tx.commit()?;
		Ok(orphans)
	}

	// ---- blocks ----

	/// Register a block of a file. Idempotent: re-registering with identical
	/// fields succeeds and changes nothing.
	pub fn register_block(
		&self,
		block_id: Uuid,
		file_id: Uuid,
		size: u64,
		checksum: Option<Hash>,
	) -> Result<BlockEntry, MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;

		let file = entry_by_id(&tx, file_id)?;
		if file.is_directory() {
			return Err(MetaError::IsDirectory(file.path));
		}

		if let Some(existing) = block_by_id_opt(&tx, block_id)? {
			if existing.file_id == file_id
				&& existing.size == size
				&& existing.checksum == checksum
			{
				return Ok(existing);
			}
			return Err(MetaError::AlreadyExists(format!("block {:?}", block_id)));
		}

		tx.execute(
			"INSERT INTO blocks (block_id, file_id, size, checksum)
			 VALUES (?1, ?2, ?3, ?4)",
			params![
				block_id.as_slice(),
				file_id.as_slice(),
				size as i64,
				checksum.as_ref().map(|c| c.as_slice().to_vec()),
			],
		)?;
		tx.execute(
			"UPDATE files SET modified_at = ?1 WHERE file_id = ?2",
			params![now_msec() as i64, file_id.as_slice()],
		)?;
		tx.commit()?;

		Ok(BlockEntry {
			block_id,
			file_id,
			size,
			checksum,
		})
	}

	/// Update the size and/or checksum of a registered block
	pub fn update_block(
		&self,
		block_id: Uuid,
		size: Option<u64>,
		checksum: Option<Hash>,
	) -> Result<BlockEntry, MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;
		let mut block = block_by_id_opt(&tx, block_id)?.ok_or(MetaError::NoSuchBlock)?;
		if let Some(size) = size {
			block.size = size;
		}
		if let Some(checksum) = checksum {
			block.checksum = Some(checksum);
		}
		tx.execute(
			"UPDATE blocks SET size = ?1, checksum = ?2 WHERE block_id = ?3",
			params![
				block.size as i64,
				block.checksum.as_ref().map(|c| c.as_slice().to_vec()),
				block_id.as_slice()
			],
		)?;
		tx.commit()?;
		Ok(block)
	}

	pub fn get_block(&self, block_id: Uuid) -> Result<BlockEntry, MetaError> {
		let db = self.lock();
		block_by_id_opt(&db, block_id)?.ok_or(MetaError::NoSuchBlock)
	}

	/// A block together with all its locations (any node status)
	pub fn get_block_with_locations(
		&self,
		block_id: Uuid,
	) -> Result<BlockWithLocations, MetaError> {
		let db = self.lock();
		let block = block_by_id_opt(&db, block_id)?.ok_or(MetaError::NoSuchBlock)?;
		let locations = locations_of(&db, block_id, false)?;
		Ok(BlockWithLocations { block, locations })
	}

	/// The ordered block list of a file with locations; `live_only` keeps
	/// only locations on active nodes
	pub fn file_blocks(
		&self,
		file_id: Uuid,
		live_only: bool,
	) -> Result<Vec<BlockWithLocations>, MetaError> {
		let db = self.lock();
		let mut stmt =
			db.prepare("SELECT * FROM blocks WHERE file_id = ?1 ORDER BY rowid")?;
		let blocks = stmt
			.query_map(params![file_id.as_slice()], row_to_block)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		let mut out = Vec::with_capacity(blocks.len());
		for block in blocks {
			let locations = locations_of(&db, block.block_id, live_only)?;
			out.push(BlockWithLocations { block, locations });
		}
		Ok(out)
	}

	/// Record that a node holds a block. When `is_leader` is set and another
	/// leader exists for the block, the new one replaces it.
	pub fn add_location(
		&self,
		block_id: Uuid,
		node_id: Uuid,
		is_leader: bool,
	) -> Result<(), MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;

		if block_by_id_opt(&tx, block_id)?.is_none() {
			return Err(MetaError::NoSuchBlock);
		}
		if node_by_id_opt(&tx, node_id)?.is_none() {
			return Err(MetaError::NoSuchNode);
		}

		if is_leader {
			tx.execute(
				"UPDATE block_locations SET is_leader = 0 WHERE block_id = ?1",
				params![block_id.as_slice()],
			)?;
		}
		tx.execute(
			"INSERT OR REPLACE INTO block_locations (block_id, datanode_id, is_leader)
			 VALUES (?1, ?2, ?3)",
			params![block_id.as_slice(), node_id.as_slice(), is_leader as i64],
		)?;
		refresh_node_block_count(&tx, node_id)?;
		tx.commit()?;
		Ok(())
	}

	pub fn remove_location(&self, block_id: Uuid, node_id: Uuid) -> Result<(), MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;
		let n = tx.execute(
			"DELETE FROM block_locations WHERE block_id = ?1 AND datanode_id = ?2",
			params![block_id.as_slice(), node_id.as_slice()],
		)?;
		if n == 0 {
			return Err(MetaError::NoSuchEntry(format!(
				"location of {:?} on {:?}",
				block_id, node_id
			)));
		}
		refresh_node_block_count(&tx, node_id)?;
		tx.commit()?;
		Ok(())
	}

	/// Blocks present on a node, with their location count (used by the
	/// balancer to prefer already-replicated blocks)
	pub fn blocks_on_node(&self, node_id: Uuid) -> Result<Vec<(BlockEntry, usize)>, MetaError> {
		let db = self.lock();
		let mut stmt = db.prepare(
			"SELECT b.block_id, b.file_id, b.size, b.checksum,
				(SELECT COUNT(*) FROM block_locations l2 WHERE l2.block_id = b.block_id)
			 FROM blocks b
			 JOIN block_locations bl ON b.block_id = bl.block_id
			 WHERE bl.datanode_id = ?1",
		)?;
		let rows = stmt
			.query_map(params![node_id.as_slice()], |row| {
				let block = row_to_block(row)?;
				let nb_locations: i64 = row.get(4)?;
				Ok((block, nb_locations as usize))
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(rows)
	}

	// ---- datanodes ----

	/// Register a storage node. When (host, port) matches an existing
	/// registration, that node is reactivated and its id returned.
	pub fn register_node(
		&self,
		host: &str,
		port: u16,
		storage_capacity: u64,
		available_space: u64,
	) -> Result<NodeEntry, MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;
		let now = now_msec();

		let existing: Option<Uuid> = tx
			.query_row(
				"SELECT node_id FROM datanodes WHERE host = ?1 AND port = ?2",
				params![host, port as i64],
				|row| get_uuid(row, 0),
			)
			.optional()?;

		let node_id = match existing {
			Some(node_id) => {
				tx.execute(
					"UPDATE datanodes SET status = 'active', storage_capacity = ?1,
						available_space = ?2, last_heartbeat = ?3
					 WHERE node_id = ?4",
					params![
						storage_capacity as i64,
						available_space as i64,
						now as i64,
						node_id.as_slice()
					],
				)?;
				debug!("Datanode {}:{} re-registered as {:?}", host, port, node_id);
				node_id
			}
			None => {
				let node_id = gen_uuid();
				tx.execute(
					"INSERT INTO datanodes (node_id, host, port, status, storage_capacity,
						available_space, last_heartbeat, blocks_stored)
					 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, 0)",
					params![
						node_id.as_slice(),
						host,
						port as i64,
						storage_capacity as i64,
						available_space as i64,
						now as i64
					],
				)?;
				info!("Datanode {}:{} registered as {:?}", host, port, node_id);
				node_id
			}
		};
		let entry = node_by_id_opt(&tx, node_id)?.ok_or(MetaError::NoSuchNode)?;
		tx.commit()?;
		Ok(entry)
	}

	pub fn get_node(&self, node_id: Uuid) -> Result<NodeEntry, MetaError> {
		let db = self.lock();
		node_by_id_opt(&db, node_id)?.ok_or(MetaError::NoSuchNode)
	}

	pub fn list_nodes(&self, status: Option<NodeStatus>) -> Result<Vec<NodeEntry>, MetaError> {
		let db = self.lock();
		let (sql, args) = match status {
			Some(s) => (
				"SELECT * FROM datanodes WHERE status = ?1",
				vec![status_str(s).to_string()],
			),
			None => ("SELECT * FROM datanodes", vec![]),
		};
		let mut stmt = db.prepare(sql)?;
		let rows = stmt
			.query_map(rusqlite::params_from_iter(args.iter()), row_to_node)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(rows)
	}

	/// Process a node heartbeat: refresh liveness and available space.
	/// Reported blocks unknown to the catalog are logged, never inserted.
	pub fn heartbeat(
		&self,
		node_id: Uuid,
		available_space: u64,
		reported_blocks: &HashMap<Uuid, BlockReport>,
	) -> Result<(), MetaError> {
		let db = self.lock();
		let n = db.execute(
			"UPDATE datanodes SET last_heartbeat = ?1, available_space = ?2, status = 'active'
			 WHERE node_id = ?3",
			params![now_msec() as i64, available_space as i64, node_id.as_slice()],
		)?;
		if n == 0 {
			return Err(MetaError::NoSuchNode);
		}

		for block_id in reported_blocks.keys() {
			let known: Option<i64> = db
				.query_row(
					"SELECT 1 FROM blocks WHERE block_id = ?1",
					params![block_id.as_slice()],
					|r| r.get(0),
				)
				.optional()?;
			if known.is_none() {
				warn!(
					"Datanode {:?} reports block {:?} unknown to the catalog",
					node_id, block_id
				);
			}
		}
		Ok(())
	}

	/// Mark a node inactive after a heartbeat timeout and drop its
	/// locations. Returns the ids of the blocks that lost a location.
	pub fn mark_inactive(&self, node_id: Uuid) -> Result<Vec<Uuid>, MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;

		let mut stmt =
			tx.prepare("SELECT block_id FROM block_locations WHERE datanode_id = ?1")?;
		let affected = stmt
			.query_map(params![node_id.as_slice()], |row| get_uuid(row, 0))?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		drop(stmt);

		tx.execute(
			"DELETE FROM block_locations WHERE datanode_id = ?1",
			params![node_id.as_slice()],
		)?;
		let n = tx.execute(
			"UPDATE datanodes SET status = 'inactive', blocks_stored = 0 WHERE node_id = ?1",
			params![node_id.as_slice()],
		)?;
		if n == 0 {
			return Err(MetaError::NoSuchNode);
		}
		tx.commit()?;
		Ok(affected)
	}

	/// Remove a long-inactive node entirely
	pub fn evict_node(&self, node_id: Uuid) -> Result<(), MetaError> {
		let mut db = self.lock();
		let tx = db.transaction()?;
		tx.execute(
			"DELETE FROM block_locations WHERE datanode_id = ?1",
			params![node_id.as_slice()],
		)?;
		let n = tx.execute(
			"DELETE FROM datanodes WHERE node_id = ?1",
			params![node_id.as_slice()],
		)?;
		if n == 0 {
			return Err(MetaError::NoSuchNode);
		}
		tx.commit()?;
		Ok(())
	}

	// ---- system ----

	pub fn stats(&self) -> Result<SystemStats, MetaError> {
		let db = self.lock();
		let count = |sql: &str| -> Result<u64, MetaError> {
			let n: i64 = db.query_row(sql, [], |r| r.get(0))?;
			Ok(n as u64)
		};
		Ok(SystemStats {
			files: count("SELECT COUNT(*) FROM files WHERE type = 'file'")?,
			directories: count("SELECT COUNT(*) FROM files WHERE type = 'directory' AND path != '/'")?,
			blocks: count("SELECT COUNT(*) FROM blocks")?,
			block_bytes: count("SELECT COALESCE(SUM(size), 0) FROM blocks")?,
			active_nodes: count("SELECT COUNT(*) FROM datanodes WHERE status = 'active'")?,
			inactive_nodes: count("SELECT COUNT(*) FROM datanodes WHERE status = 'inactive'")?,
		})
	}
}

// ---- path helpers ----

/// Validate and normalize an absolute namespace path
pub fn normalize_path(path: &str) -> Result<String, MetaError> {
	if !path.starts_with('/') {
		return Err(MetaError::InvalidPath(format!(
			"{}: not an absolute path",
			path
		)));
	}
	if path == "/" {
		return Ok("/".to_string());
	}
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		return Ok("/".to_string());
	}
	for segment in trimmed[1..].split('/') {
		if segment.is_empty() {
			return Err(MetaError::InvalidPath(format!(
				"{}: empty path segment",
				path
			)));
		}
		if segment == "." || segment == ".." {
			return Err(MetaError::InvalidPath(format!(
				"{}: relative path segment",
				path
			)));
		}
	}
	Ok(trimmed.to_string())
}

/// Parent of a normalized path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
	if path == "/" {
		return None;
	}
	match path.rfind('/') {
		Some(0) => Some("/"),
		Some(i) => Some(&path[..i]),
		None => None,
	}
}

/// Last segment of a normalized path; empty for the root
pub fn entry_name(path: &str) -> &str {
	if path == "/" {
		return "";
	}
	path.rsplit('/').next().unwrap_or("")
}

fn escape_like(s: &str) -> String {
	s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ---- row mapping ----

pub(crate) fn get_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
	let v: Vec<u8> = row.get(idx)?;
	Uuid::try_from(&v[..]).map_err(|_| {
		rusqlite::Error::FromSqlConversionFailure(
			idx,
			rusqlite::types::Type::Blob,
			"invalid identifier length".into(),
		)
	})
}

fn get_opt_hash(row: &Row, idx: usize) -> rusqlite::Result<Option<Hash>> {
	let v: Option<Vec<u8>> = row.get(idx)?;
	match v {
		None => Ok(None),
		Some(v) => Hash::try_from(&v[..]).map(Some).map_err(|_| {
			rusqlite::Error::FromSqlConversionFailure(
				idx,
				rusqlite::types::Type::Blob,
				"invalid checksum length".into(),
			)
		}),
	}
}

fn parse_file_type(s: &str) -> FileType {
	if s == "directory" {
		FileType::Directory
	} else {
		FileType::File
	}
}

fn status_str(s: NodeStatus) -> &'static str {
	match s {
		NodeStatus::Active => "active",
		NodeStatus::Inactive => "inactive",
	}
}

fn parse_status(s: &str) -> NodeStatus {
	if s == "active" {
		NodeStatus::Active
	} else {
		NodeStatus::Inactive
	}
}

// Column order matches the files table declaration
pub(crate) fn row_to_entry(row: &Row) -> rusqlite::Result<FileEntry> {
	Ok(FileEntry {
		file_id: get_uuid(row, 0)?,
		name: row.get(1)?,
		path: row.get(2)?,
		file_type: parse_file_type(&row.get::<_, String>(3)?),
		size: row.get::<_, i64>(4)? as u64,
		created_at: row.get::<_, i64>(5)? as u64,
		modified_at: row.get::<_, i64>(6)? as u64,
		owner: row.get(7)?,
	})
}

pub(crate) fn row_to_block(row: &Row) -> rusqlite::Result<BlockEntry> {
	Ok(BlockEntry {
		block_id: get_uuid(row, 0)?,
		file_id: get_uuid(row, 1)?,
		size: row.get::<_, i64>(2)? as u64,
		checksum: get_opt_hash(row, 3)?,
	})
}

pub(crate) fn row_to_node(row: &Row) -> rusqlite::Result<NodeEntry> {
	Ok(NodeEntry {
		node_id: get_uuid(row, 0)?,
		host: row.get(1)?,
		port: row.get::<_, i64>(2)? as u16,
		status: parse_status(&row.get::<_, String>(3)?),
		storage_capacity: row.get::<_, i64>(4)? as u64,
		available_space: row.get::<_, i64>(5)? as u64,
		last_heartbeat: row.get::<_, i64>(6)? as u64,
		blocks_stored: row.get::<_, i64>(7)? as u64,
	})
}

fn row_to_entry_opt(
	conn: &Connection,
	sql: &str,
	arg: &str,
) -> Result<Option<FileEntry>, MetaError> {
	Ok(conn.query_row(sql, params![arg], row_to_entry).optional()?)
}

fn entry_by_id(conn: &Connection, file_id: Uuid) -> Result<FileEntry, MetaError> {
	conn.query_row(
		"SELECT * FROM files WHERE file_id = ?1",
		params![file_id.as_slice()],
		row_to_entry,
	)
	.optional()?
	.ok_or_else(|| MetaError::NoSuchEntry(format!("{:?}", file_id)))
}

fn block_by_id_opt(conn: &Connection, block_id: Uuid) -> Result<Option<BlockEntry>, MetaError> {
	Ok(conn
		.query_row(
			"SELECT * FROM blocks WHERE block_id = ?1",
			params![block_id.as_slice()],
			row_to_block,
		)
		.optional()?)
}

fn node_by_id_opt(conn: &Connection, node_id: Uuid) -> Result<Option<NodeEntry>, MetaError> {
	Ok(conn
		.query_row(
			"SELECT * FROM datanodes WHERE node_id = ?1",
			params![node_id.as_slice()],
			row_to_node,
		)
		.optional()?)
}

fn locations_of(
	conn: &Connection,
	block_id: Uuid,
	live_only: bool,
) -> Result<Vec<LocationInfo>, MetaError> {
	let sql = if live_only {
		"SELECT bl.datanode_id, bl.is_leader, d.host, d.port, d.status
		 FROM block_locations bl JOIN datanodes d ON bl.datanode_id = d.node_id
		 WHERE bl.block_id = ?1 AND d.status = 'active'"
	} else {
		"SELECT bl.datanode_id, bl.is_leader, d.host, d.port, d.status
		 FROM block_locations bl JOIN datanodes d ON bl.datanode_id = d.node_id
		 WHERE bl.block_id = ?1"
	};
	let mut stmt = conn.prepare(sql)?;
	let rows = stmt
		.query_map(params![block_id.as_slice()], |row| {
			Ok(LocationInfo {
				node_id: get_uuid(row, 0)?,
				is_leader: row.get::<_, i64>(1)? != 0,
				host: row.get(2)?,
				port: row.get::<_, i64>(3)? as u16,
				status: parse_status(&row.get::<_, String>(4)?),
			})
		})?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	Ok(rows)
}

/// Delete the blocks and locations of a file, returning what was orphaned
fn delete_file_rows(conn: &Connection, file_id: Uuid) -> Result<OrphanedBlocks, MetaError> {
	let mut stmt = conn.prepare("SELECT block_id FROM blocks WHERE file_id = ?1")?;
	let block_ids = stmt
		.query_map(params![file_id.as_slice()], |row| get_uuid(row, 0))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	drop(stmt);

	let mut orphans = vec![];
	for block_id in block_ids {
		let holders = locations_of(conn, block_id, true)?
			.iter()
			.map(NodeRef::from)
			.collect::<Vec<_>>();
		conn.execute(
			"DELETE FROM block_locations WHERE block_id = ?1",
			params![block_id.as_slice()],
		)?;
		conn.execute("DELETE FROM blocks WHERE block_id = ?1", params![block_id.as_slice()])?;
		orphans.push((block_id, holders));
	}
	Ok(orphans)
}

fn refresh_node_block_count(conn: &Connection, node_id: Uuid) -> Result<(), MetaError> {
	conn.execute(
		"UPDATE datanodes SET blocks_stored =
			(SELECT COUNT(*) FROM block_locations WHERE datanode_id = ?1)
		 WHERE node_id = ?1",
		params![node_id.as_slice()],
	)?;
	Ok(())
}

fn refresh_block_counts(conn: &Connection) -> Result<(), MetaError> {
	conn.execute(
		"UPDATE datanodes SET blocks_stored =
			(SELECT COUNT(*) FROM block_locations WHERE datanode_id = datanodes.node_id)",
		[],
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn catalog() -> Catalog {
		Catalog::open_in_memory().unwrap()
	}

	fn mkdir(c: &Catalog, path: &str) -> FileEntry {
		c.create_entry(path, FileType::Directory, 0, None).unwrap()
	}

	fn mkfile(c: &Catalog, path: &str, size: u64) -> FileEntry {
		c.create_entry(path, FileType::File, size, Some("tester")).unwrap()
	}

	fn register_test_node(c: &Catalog, port: u16) -> NodeEntry {
		c.register_node("127.0.0.1", port, 1 << 30, 1 << 30).unwrap()
	}

	#[test]
	fn test_root_exists() {
		let c = catalog();
		let root = c.get_by_path("/").unwrap();
		assert!(root.is_directory());
	}

	#[test]
	fn test_create_entry_parent_checks() {
		let c = catalog();
		assert!(matches!(
			c.create_entry("/a/b", FileType::File, 0, None),
			Err(MetaError::ParentMissing(_))
		));
		mkdir(&c, "/a");
		let f = mkfile(&c, "/a/b", 12);
		assert_eq!(f.name, "b");
		assert!(matches!(
			c.create_entry("/a/b", FileType::File, 0, None),
			Err(MetaError::AlreadyExists(_))
		));
		assert!(matches!(
			c.create_entry("/a/b/c", FileType::File, 0, None),
			Err(MetaError::ParentNotDirectory(_))
		));
	}

	#[test]
	fn test_mkdir_on_existing_is_conflict() {
		let c = catalog();
		mkdir(&c, "/x");
		assert!(matches!(
			c.create_entry("/x", FileType::Directory, 0, None),
			Err(MetaError::AlreadyExists(_))
		));
	}

	#[test]
	fn test_path_is_unique() {
		let c = catalog();
		mkdir(&c, "/d");
		mkfile(&c, "/d/f", 1);
		assert!(c.create_entry("/d/f", FileType::Directory, 0, None).is_err());
		assert_eq!(c.list_directory("/d").unwrap().len(), 1);
	}

	#[test]
	fn test_list_directory() {
		let c = catalog();
		mkdir(&c, "/a");
		mkdir(&c, "/a/sub");
		mkfile(&c, "/a/f1", 1);
		mkfile(&c, "/a/sub/deep", 1);
		mkfile(&c, "/top", 1);

		let names = |path: &str| -> Vec<String> {
			let mut v = c
				.list_directory(path)
				.unwrap()
				.into_iter()
				.map(|e| e.name)
				.collect::<Vec<_>>();
			v.sort();
			v
		};
		assert_eq!(names("/a"), vec!["f1", "sub"]);
		assert_eq!(names("/"), vec!["a", "top"]);
		assert_eq!(names("/a/sub"), vec!["deep"]);
		assert!(matches!(
			c.list_directory("/a/f1"),
			Err(MetaError::NotDirectory(_))
		));
		assert!(matches!(
			c.list_directory("/nope"),
			Err(MetaError::NoSuchEntry(_))
		));
	}

	#[test]
	fn test_delete_directory_requires_empty_or_recursive() {
		let c = catalog();
		mkdir(&c, "/x");
		mkdir(&c, "/x/y");
		mkfile(&c, "/x/y/f", 4);

		assert!(matches!(
			c.delete_directory("/x", false),
			Err(MetaError::DirectoryNotEmpty(_))
		));
		c.delete_directory("/x", true).unwrap();
		assert!(c.get_by_path("/x").is_err());
		assert!(c.get_by_path("/x/y/f").is_err());
		assert_eq!(c.list_directory("/").unwrap().len(), 0);
	}

	#[test]
	fn test_delete_file_removes_blocks_and_locations() {
		let c = catalog();
		let f = mkfile(&c, "/data", 8);
		let n = register_test_node(&c, 9000);
		let b = gen_uuid();
		c.register_block(b, f.file_id, 8, None).unwrap();
		c.add_location(b, n.node_id, true).unwrap();

		let orphans = c.delete_file(f.file_id).unwrap();
		assert_eq!(orphans.len(), 1);
		assert_eq!(orphans[0].0, b);
		assert_eq!(orphans[0].1[0].node_id, n.node_id);
		assert!(c.get_block(b).is_err());
		assert_eq!(c.get_node(n.node_id).unwrap().blocks_stored, 0);
	}

	#[test]
	fn test_register_block_idempotent() {
		let c = catalog();
		let f = mkfile(&c, "/f", 4);
		let b = gen_uuid();
		let ck = silo_util::data::sha256sum(b"data");
		c.register_block(b, f.file_id, 4, Some(ck)).unwrap();
		// identical re-registration succeeds
		c.register_block(b, f.file_id, 4, Some(ck)).unwrap();
		// conflicting re-registration fails
		assert!(matches!(
			c.register_block(b, f.file_id, 5, Some(ck)),
			Err(MetaError::AlreadyExists(_))
		));
	}

	#[test]
	fn test_single_leader_invariant() {
		let c = catalog();
		let f = mkfile(&c, "/f", 4);
		let b = gen_uuid();
		c.register_block(b, f.file_id, 4, None).unwrap();
		let n1 = register_test_node(&c, 9001);
		let n2 = register_test_node(&c, 9002);

		c.add_location(b, n1.node_id, true).unwrap();
		c.add_location(b, n2.node_id, true).unwrap();

		let locs = c.get_block_with_locations(b).unwrap().locations;
		let leaders = locs.iter().filter(|l| l.is_leader).count();
		assert_eq!(leaders, 1);
		assert!(locs.iter().any(|l| l.node_id == n2.node_id && l.is_leader));
	}

	#[test]
	fn test_register_node_reuses_host_port() {
		let c = catalog();
		let n1 = register_test_node(&c, 9000);
		let n2 = register_test_node(&c, 9000);
		assert_eq!(n1.node_id, n2.node_id);
		let n3 = register_test_node(&c, 9001);
		assert_ne!(n1.node_id, n3.node_id);
	}

	#[test]
	fn test_heartbeat_updates_and_is_idempotent() {
		let c = catalog();
		let n = register_test_node(&c, 9000);
		let before = c.get_node(n.node_id).unwrap().last_heartbeat;

		std::thread::sleep(std::time::Duration::from_millis(5));
		c.heartbeat(n.node_id, 123, &HashMap::new()).unwrap();
		let after1 = c.get_node(n.node_id).unwrap();
		assert!(after1.last_heartbeat >= before);
		assert_eq!(after1.available_space, 123);

		c.heartbeat(n.node_id, 123, &HashMap::new()).unwrap();
		let after2 = c.get_node(n.node_id).unwrap();
		assert_eq!(after2.available_space, 123);
		assert!(after2.last_heartbeat >= after1.last_heartbeat);

		assert!(matches!(
			c.heartbeat(gen_uuid(), 1, &HashMap::new()),
			Err(MetaError::NoSuchNode)
		));
	}

	#[test]
	fn test_mark_inactive_drops_locations() {
		let c = catalog();
		let f = mkfile(&c, "/f", 4);
		let b = gen_uuid();
		c.register_block(b, f.file_id, 4, None).unwrap();
		let n1 = register_test_node(&c, 9001);
		let n2 = register_test_node(&c, 9002);
		c.add_location(b, n1.node_id, true).unwrap();
		c.add_location(b, n2.node_id, false).unwrap();

		let affected = c.mark_inactive(n1.node_id).unwrap();
		assert_eq!(affected, vec![b]);
		assert_eq!(c.get_node(n1.node_id).unwrap().status, NodeStatus::Inactive);
		let locs = c.get_block_with_locations(b).unwrap().locations;
		assert_eq!(locs.len(), 1);
		assert_eq!(locs[0].node_id, n2.node_id);
	}

	#[test]
	fn test_evict_node_removes_row() {
		let c = catalog();
		let n = register_test_node(&c, 9000);
		c.mark_inactive(n.node_id).unwrap();
		c.evict_node(n.node_id).unwrap();
		assert!(matches!(c.get_node(n.node_id), Err(MetaError::NoSuchNode)));
	}

	#[test]
	fn test_file_blocks_ordered_by_registration() {
		let c = catalog();
		let f = mkfile(&c, "/f", 12);
		let ids: Vec<Uuid> = (0..3).map(|_| gen_uuid()).collect();
		for id in &ids {
			c.register_block(*id, f.file_id, 4, None).unwrap();
		}
		let blocks = c.file_blocks(f.file_id, false).unwrap();
		let got: Vec<Uuid> = blocks.iter().map(|b| b.block.block_id).collect();
		assert_eq!(got, ids);
	}

	#[test]
	fn test_stats() {
		let c = catalog();
		mkdir(&c, "/d");
		let f = mkfile(&c, "/d/f", 10);
		c.register_block(gen_uuid(), f.file_id, 10, None).unwrap();
		register_test_node(&c, 9000);

		let stats = c.stats().unwrap();
		assert_eq!(stats.files, 1);
		assert_eq!(stats.directories, 1);
		assert_eq!(stats.blocks, 1);
		assert_eq!(stats.block_bytes, 10);
		assert_eq!(stats.active_nodes, 1);
	}

	#[test]
	fn test_normalize_path() {
		assert_eq!(normalize_path("/a/b/").unwrap(), "/a/b");
		assert_eq!(normalize_path("/").unwrap(), "/");
		assert!(normalize_path("a/b").is_err());
		assert!(normalize_path("/a//b").is_err());
		assert!(normalize_path("/a/../b").is_err());
	}

	#[test]
	fn test_parent_path() {
		assert_eq!(parent_path("/a/b"), Some("/a"));
		assert_eq!(parent_path("/a"), Some("/"));
		assert_eq!(parent_path("/"), None);
	}
}
