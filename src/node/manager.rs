//! Local block store of a storage node
//!
//! Blocks live in a single flat directory, one regular file per block named
//! by the block identifier, payload only. Mutations take a per-block lock
//! (256-way striped on the first byte of the id) so operations on distinct
//! blocks never wait on each other.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use rand::prelude::*;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use silo_rpc::messages::BlockReport;
use silo_util::data::{Hash, Uuid};
use silo_util::error::Error;

pub struct BlockStore {
	data_dir: PathBuf,
	mutation_lock: [Mutex<BlockStoreLocked>; 256],
}

// Functions that must only run while the per-block lock is held are methods
// of this type, which is only reachable through the mutex.
struct BlockStoreLocked();

impl BlockStore {
	pub async fn new(data_dir: PathBuf) -> Result<Arc<Self>, Error> {
		fs::create_dir_all(&data_dir).await?;
		Ok(Arc::new(Self {
			data_dir,
			mutation_lock: [(); 256].map(|_| Mutex::new(BlockStoreLocked())),
		}))
	}

	fn block_path(&self, block_id: &Uuid) -> PathBuf {
		self.data_dir.join(hex::encode(block_id.as_slice()))
	}

	async fn lock_mutate(&self, block_id: &Uuid) -> MutexGuard<'_, BlockStoreLocked> {
		self.mutation_lock[block_id.as_slice()[0] as usize]
			.lock()
			.await
	}

	/// Write a block to disk, atomically, and return the payload checksum.
	/// Overwriting an existing block with the same id is allowed (the id is
	/// content-opaque, the payload for an id never changes).
	pub async fn write_block(&self, block_id: &Uuid, data: &[u8]) -> Result<Hash, Error> {
		self.lock_mutate(block_id)
			.await
			.write_block(block_id, data, self)
			.await
	}

	/// Read a whole block from disk
	pub async fn read_block(&self, block_id: &Uuid) -> Result<Bytes, Error> {
		let data = fs::read(self.block_path(block_id)).await?;
		Ok(data.into())
	}

	/// Size and streamed checksum of a block, `None` if absent
	pub async fn check_block(&self, block_id: &Uuid) -> Result<Option<(u64, Hash)>, Error> {
		let path = self.block_path(block_id);
		let meta = match fs::metadata(&path).await {
			Ok(m) => m,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let checksum = stream_checksum(&path).await?;
		Ok(Some((meta.len(), checksum)))
	}

	pub async fn block_exists(&self, block_id: &Uuid) -> bool {
		fs::metadata(self.block_path(block_id)).await.is_ok()
	}

	/// Delete a block; returns false if it was not there
	pub async fn delete_block(&self, block_id: &Uuid) -> Result<bool, Error> {
		self.lock_mutate(block_id)
			.await
			.delete_block(block_id, self)
			.await
	}

	/// Scan the data directory and report every stored block with its size
	/// and checksum; used for heartbeat inventories
	pub async fn inventory(&self) -> Result<HashMap<Uuid, BlockReport>, Error> {
		let mut out = HashMap::new();
		let mut dir = fs::read_dir(&self.data_dir).await?;
		while let Some(ent) = dir.next_entry().await? {
			if !ent.file_type().await?.is_file() {
				continue;
			}
			let name = ent.file_name();
			let name = match name.to_str() {
				Some(n) => n,
				None => continue,
			};
			let block_id = match Uuid::from_hex(name) {
				Some(id) => id,
				// temp files and strays are not part of the inventory
				None => continue,
			};
			let size = ent.metadata().await?.len();
			let checksum = stream_checksum(&ent.path()).await?;
			out.insert(block_id, BlockReport { size, checksum });
		}
		Ok(out)
	}

	/// Total bytes currently stored
	pub async fn used_space(&self) -> Result<u64, Error> {
		let mut total = 0;
		let mut dir = fs::read_dir(&self.data_dir).await?;
		while let Some(ent) = dir.next_entry().await? {
			if ent.file_type().await?.is_file() {
				total += ent.metadata().await?.len();
			}
		}
		Ok(total)
	}

	/// Capacity and free space of the filesystem holding the data directory
	pub fn disk_space(&self) -> Result<(u64, u64), Error> {
		let total = fs2::total_space(&self.data_dir)?;
		let avail = fs2::available_space(&self.data_dir)?;
		Ok((total, avail))
	}
}

impl BlockStoreLocked {
	async fn write_block(
		&self,
		block_id: &Uuid,
		data: &[u8],
		store: &BlockStore,
	) -> Result<Hash, Error> {
		let path = store.block_path(block_id);

		let mut path_tmp = path.clone();
		let tmp_extension = format!("tmp{}", hex::encode(thread_rng().gen::<[u8; 4]>()));
		path_tmp.set_extension(tmp_extension);

		let mut delete_on_drop = DeleteOnDrop(Some(path_tmp.clone()));

		let mut f = fs::File::create(&path_tmp).await?;
		f.write_all(data).await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(&path_tmp, &path).await?;
		delete_on_drop.cancel();

		// fsync the directory so the rename itself is durable
		let dir = fs::OpenOptions::new()
			.read(true)
			.open(&store.data_dir)
			.await?;
		dir.sync_all().await?;
		drop(dir);

		Ok(silo_util::data::sha256sum(data))
	}

	async fn delete_block(&self, block_id: &Uuid, store: &BlockStore) -> Result<bool, Error> {
		let path = store.block_path(block_id);
		match fs::remove_file(&path).await {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}
}

async fn stream_checksum(path: &std::path::Path) -> Result<Hash, Error> {
	let mut f = fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let n = f.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	Ok(hash.into())
}

struct DeleteOnDrop(Option<PathBuf>);

impl DeleteOnDrop {
	fn cancel(&mut self) {
		drop(self.0.take());
	}
}

impl Drop for DeleteOnDrop {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			tokio::spawn(async move {
				if let Err(e) = fs::remove_file(&path).await {
					debug!("DeleteOnDrop failed for {}: {}", path.display(), e);
				}
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::data::{gen_uuid, sha256sum};

	async fn test_store() -> (mktemp::Temp, Arc<BlockStore>) {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = BlockStore::new(tmp.to_path_buf()).await.unwrap();
		(tmp, store)
	}

	#[tokio::test]
	async fn test_write_read_delete() {
		let (_tmp, store) = test_store().await;
		let id = gen_uuid();
		let data = b"some block payload".to_vec();

		let checksum = store.write_block(&id, &data).await.unwrap();
		assert_eq!(checksum, sha256sum(&data));
		assert!(store.block_exists(&id).await);
		assert_eq!(&store.read_block(&id).await.unwrap()[..], &data[..]);

		let (size, ck) = store.check_block(&id).await.unwrap().unwrap();
		assert_eq!(size, data.len() as u64);
		assert_eq!(ck, checksum);

		assert!(store.delete_block(&id).await.unwrap());
		assert!(!store.delete_block(&id).await.unwrap());
		assert!(store.check_block(&id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_missing_block() {
		let (_tmp, store) = test_store().await;
		let id = gen_uuid();
		assert!(!store.block_exists(&id).await);
		assert!(store.read_block(&id).await.is_err());
	}

	#[tokio::test]
	async fn test_inventory_skips_strays() {
		let (_tmp, store) = test_store().await;
		let a = gen_uuid();
		let b = gen_uuid();
		store.write_block(&a, b"aaaa").await.unwrap();
		store.write_block(&b, b"bb").await.unwrap();
		// a stray temp file must not appear in the inventory
		tokio::fs::write(store.data_dir.join("not-a-block.tmp1234"), b"x")
			.await
			.unwrap();

		let inv = store.inventory().await.unwrap();
		assert_eq!(inv.len(), 2);
		assert_eq!(inv[&a].size, 4);
		assert_eq!(inv[&b].checksum, sha256sum(b"bb"));
	}

	#[tokio::test]
	async fn test_overwrite_same_id() {
		let (_tmp, store) = test_store().await;
		let id = gen_uuid();
		store.write_block(&id, b"one").await.unwrap();
		store.write_block(&id, b"one").await.unwrap();
		assert_eq!(&store.read_block(&id).await.unwrap()[..], b"one");
	}
}
