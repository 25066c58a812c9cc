//! Compression of block payloads for transfer
//!
//! Payloads above a size floor are compressed before being chunked; the
//! transfer is self-describing: the first chunk of a stream carries the
//! algorithm, level and original size, so any node can decompress without
//! out-of-band state.
use std::io::{Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use silo_util::error::Error;

/// Payloads smaller than this are never compressed
pub const MIN_COMPRESS_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
	Zlib,
	Lzma,
}

impl FromStr for CompressionAlgorithm {
	type Err = Error;
	fn from_str(s: &str) -> Result<Self, Error> {
		match s {
			"zlib" => Ok(CompressionAlgorithm::Zlib),
			"lzma" => Ok(CompressionAlgorithm::Lzma),
			_ => Err(Error::Message(format!(
				"unsupported compression algorithm: {}",
				s
			))),
		}
	}
}

/// Self-describing compression header carried on the first chunk of a
/// compressed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMeta {
	pub algorithm: CompressionAlgorithm,
	pub level: u32,
	pub original_size: u64,
}

/// Compress a payload if worthwhile. Returns the bytes to transmit and the
/// metadata to attach; `None` metadata means the payload travels as-is
/// (too small, or compression did not shrink it).
pub fn compress(
	data: &[u8],
	algorithm: CompressionAlgorithm,
	level: u32,
) -> Result<(Vec<u8>, Option<CompressionMeta>), Error> {
	if data.len() < MIN_COMPRESS_SIZE {
		return Ok((data.to_vec(), None));
	}

	let compressed = match algorithm {
		CompressionAlgorithm::Zlib => {
			let mut enc =
				flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
			enc.write_all(data)?;
			enc.finish()?
		}
		CompressionAlgorithm::Lzma => {
			let mut enc = xz2::write::XzEncoder::new(Vec::new(), level);
			enc.write_all(data)?;
			enc.finish()?
		}
	};

	if compressed.len() >= data.len() {
		return Ok((data.to_vec(), None));
	}

	let meta = CompressionMeta {
		algorithm,
		level,
		original_size: data.len() as u64,
	};
	Ok((compressed, Some(meta)))
}

/// Decompress a payload according to its transfer metadata
pub fn decompress(data: &[u8], meta: &CompressionMeta) -> Result<Vec<u8>, Error> {
	let mut out = Vec::with_capacity(meta.original_size as usize);
	match meta.algorithm {
		CompressionAlgorithm::Zlib => {
			flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
		}
		CompressionAlgorithm::Lzma => {
			xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
		}
	}
	if out.len() as u64 != meta.original_size {
		return Err(Error::Message(format!(
			"decompressed size {} does not match advertised original size {}",
			out.len(),
			meta.original_size
		)));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_small_payload_not_compressed() {
		let data = vec![0u8; MIN_COMPRESS_SIZE - 1];
		let (out, meta) = compress(&data, CompressionAlgorithm::Zlib, 5).unwrap();
		assert!(meta.is_none());
		assert_eq!(out, data);
	}

	#[test]
	fn test_incompressible_payload_sent_plain() {
		let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
		let (out, meta) = compress(&data, CompressionAlgorithm::Zlib, 5).unwrap();
		assert!(meta.is_none());
		assert_eq!(out, data);
	}

	#[test]
	fn test_zlib_roundtrip() {
		let data = vec![42u8; 64 * 1024];
		let (out, meta) = compress(&data, CompressionAlgorithm::Zlib, 5).unwrap();
		let meta = meta.expect("repetitive payload should compress");
		assert!(out.len() < data.len());
		assert_eq!(decompress(&out, &meta).unwrap(), data);
	}

	#[test]
	fn test_lzma_roundtrip() {
		let data = b"the quick brown fox ".repeat(1000);
		let (out, meta) = compress(&data, CompressionAlgorithm::Lzma, 5).unwrap();
		let meta = meta.expect("repetitive payload should compress");
		assert_eq!(decompress(&out, &meta).unwrap(), data);
	}

	#[test]
	fn test_decompress_checks_original_size() {
		let data = vec![7u8; 8192];
		let (out, meta) = compress(&data, CompressionAlgorithm::Zlib, 5).unwrap();
		let mut meta = meta.unwrap();
		meta.original_size += 1;
		assert!(decompress(&out, &meta).is_err());
	}
}
