//! Partitioning of local files into fixed-size blocks
use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use silo_util::data::{gen_uuid, sha256sum, Hash, Uuid};
use silo_util::error::Error;

/// One block of a partitioned file. The payload itself is not held here:
/// upload workers re-read their byte range from the local file.
#[derive(Debug, Clone)]
pub struct BlockSpec {
	pub block_id: Uuid,
	pub index: usize,
	pub offset: u64,
	pub size: u64,
	pub checksum: Hash,
}

pub struct FileSplitter {
	block_size: usize,
}

impl FileSplitter {
	pub fn new(block_size: usize) -> Result<Self, Error> {
		if block_size == 0 {
			return Err(Error::Message("block size must be positive".into()));
		}
		Ok(Self { block_size })
	}

	/// Partition a file into blocks of `block_size` bytes. The last block
	/// may be shorter; an empty file yields no blocks. Each block gets a
	/// fresh opaque id and a SHA-256 checksum of its bytes.
	pub async fn split_file(&self, path: &Path) -> Result<Vec<BlockSpec>, Error> {
		let mut file = fs::File::open(path).await?;
		let file_size = file.metadata().await?.len();
		let n_blocks = ((file_size + self.block_size as u64 - 1) / self.block_size as u64) as usize;

		let mut blocks = Vec::with_capacity(n_blocks);
		let mut buf = vec![0u8; self.block_size];
		let mut offset = 0u64;
		for index in 0..n_blocks {
			let want = std::cmp::min(self.block_size as u64, file_size - offset) as usize;
			file.read_exact(&mut buf[..want]).await?;
			blocks.push(BlockSpec {
				block_id: gen_uuid(),
				index,
				offset,
				size: want as u64,
				checksum: sha256sum(&buf[..want]),
			});
			offset += want as u64;
		}
		Ok(blocks)
	}

	/// Re-read the byte range of one block
	pub async fn read_block(path: &Path, spec: &BlockSpec) -> Result<Vec<u8>, Error> {
		let mut file = fs::File::open(path).await?;
		file.seek(SeekFrom::Start(spec.offset)).await?;
		let mut buf = vec![0u8; spec.size as usize];
		file.read_exact(&mut buf).await?;
		Ok(buf)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn write_tmp(data: &[u8]) -> (mktemp::Temp, std::path::PathBuf) {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let path = tmp.to_path_buf().join("input");
		fs::write(&path, data).await.unwrap();
		(tmp, path)
	}

	#[tokio::test]
	async fn test_empty_file_has_no_blocks() {
		let (_tmp, path) = write_tmp(b"").await;
		let blocks = FileSplitter::new(4).unwrap().split_file(&path).await.unwrap();
		assert!(blocks.is_empty());
	}

	#[tokio::test]
	async fn test_exact_block_size_is_one_block() {
		let (_tmp, path) = write_tmp(b"abcd").await;
		let blocks = FileSplitter::new(4).unwrap().split_file(&path).await.unwrap();
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0].size, 4);
	}

	#[tokio::test]
	async fn test_one_byte_over_makes_short_tail() {
		let (_tmp, path) = write_tmp(b"abcde").await;
		let blocks = FileSplitter::new(4).unwrap().split_file(&path).await.unwrap();
		assert_eq!(blocks.len(), 2);
		assert_eq!(blocks[0].size, 4);
		assert_eq!(blocks[1].size, 1);
		assert_eq!(blocks[1].offset, 4);
	}

	#[tokio::test]
	async fn test_split_then_join_is_identity() {
		let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
		let (_tmp, path) = write_tmp(&data).await;
		let splitter = FileSplitter::new(4096).unwrap();
		let blocks = splitter.split_file(&path).await.unwrap();
		assert_eq!(blocks.len(), 3);

		let mut joined = vec![];
		for spec in &blocks {
			let chunk = FileSplitter::read_block(&path, spec).await.unwrap();
			assert_eq!(sha256sum(&chunk), spec.checksum);
			joined.extend_from_slice(&chunk);
		}
		assert_eq!(joined, data);
	}

	#[tokio::test]
	async fn test_twelve_bytes_in_three_blocks() {
		let (_tmp, path) = write_tmp(b"hello world\n").await;
		let blocks = FileSplitter::new(4).unwrap().split_file(&path).await.unwrap();
		assert_eq!(blocks.len(), 3);
		assert!(blocks.iter().all(|b| b.size == 4));
	}
}
