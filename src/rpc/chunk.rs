//! Chunked framing of block payloads over HTTP bodies
//!
//! A block transfer is a sequence of frames. Each frame is one version byte,
//! a big-endian u32 length, and a Messagepack-encoded [`ChunkFrame`]. The
//! first frame of a stream carries the total transmitted size and the
//! optional compression header; subsequent frames carry only offset and
//! data. Frames hold at most [`MAX_CHUNK_SIZE`] bytes of payload.
use bytes::{BufMut, Bytes, BytesMut};
use hyper::body::HttpBody;
use hyper::Body;
use serde::{Deserialize, Serialize};

use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::compress::CompressionMeta;

/// Maximum payload bytes per frame
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Version tag prefixed to every frame
pub const FRAME_VERSION: u8 = 1;

const FRAME_HEADER_SIZE: usize = 5;

/// One frame of a block transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFrame {
	pub block_id: Uuid,
	pub offset: u64,
	#[serde(with = "serde_bytes")]
	pub data: Vec<u8>,
	/// Total transmitted payload size; first frame only
	#[serde(default)]
	pub total_size: Option<u64>,
	/// Compression header; first frame only, absent for plain transfers
	#[serde(default)]
	pub compression: Option<CompressionMeta>,
}

/// Encode a frame to its wire representation
pub fn encode_frame(frame: &ChunkFrame) -> Result<Bytes, Error> {
	let body = rmp_serde::to_vec_named(frame)?;
	let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
	buf.put_u8(FRAME_VERSION);
	buf.put_u32(body.len() as u32);
	buf.put_slice(&body);
	Ok(buf.freeze())
}

/// Split a (possibly compressed) payload into the frames of a transfer
pub fn make_frames(
	block_id: Uuid,
	payload: &[u8],
	compression: Option<CompressionMeta>,
) -> Result<Vec<Bytes>, Error> {
	let total_size = payload.len() as u64;
	let mut frames = vec![];
	let mut offset = 0usize;
	loop {
		let end = std::cmp::min(offset + MAX_CHUNK_SIZE, payload.len());
		let frame = ChunkFrame {
			block_id,
			offset: offset as u64,
			data: payload[offset..end].to_vec(),
			total_size: if offset == 0 { Some(total_size) } else { None },
			compression: if offset == 0 { compression } else { None },
		};
		frames.push(encode_frame(&frame)?);
		offset = end;
		if offset >= payload.len() {
			break;
		}
	}
	Ok(frames)
}

/// Build a streaming HTTP body from pre-encoded frames
pub fn frames_to_body(frames: Vec<Bytes>) -> Body {
	Body::wrap_stream(futures::stream::iter(
		frames.into_iter().map(Ok::<Bytes, std::io::Error>),
	))
}

/// Incremental decoder turning raw bytes back into frames
#[derive(Default)]
pub struct FrameDecoder {
	buf: BytesMut,
}

impl FrameDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Decode the next complete frame, if the buffer holds one
	pub fn try_next(&mut self) -> Result<Option<ChunkFrame>, Error> {
		if self.buf.len() < FRAME_HEADER_SIZE {
			return Ok(None);
		}
		if self.buf[0] != FRAME_VERSION {
			return Err(Error::Message(format!(
				"unsupported chunk frame version {}",
				self.buf[0]
			)));
		}
		let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
		// payload cap plus room for the frame's own fields
		if len > MAX_CHUNK_SIZE + 4096 {
			return Err(Error::Message(format!("oversized chunk frame ({} bytes)", len)));
		}
		if self.buf.len() < FRAME_HEADER_SIZE + len {
			return Ok(None);
		}
		let _ = self.buf.split_to(FRAME_HEADER_SIZE);
		let body = self.buf.split_to(len);
		let frame: ChunkFrame = rmp_serde::decode::from_read_ref(&body)?;
		Ok(Some(frame))
	}

	/// Whether undecoded bytes remain
	pub fn has_pending(&self) -> bool {
		!self.buf.is_empty()
	}
}

/// A reassembled transfer: the transmitted payload plus its header fields
pub struct StreamPayload {
	pub block_id: Uuid,
	pub data: Vec<u8>,
	pub compression: Option<CompressionMeta>,
}

/// Collect the frames of a body into a contiguous payload, checking frame
/// offsets for gaps and overlaps
pub async fn collect_frames(mut body: Body) -> Result<StreamPayload, Error> {
	let mut decoder = FrameDecoder::new();
	let mut payload: Option<StreamPayload> = None;
	let mut expected_total: u64 = 0;

	loop {
		let buf = match body.data().await {
			Some(b) => b?,
			None => break,
		};
		decoder.push(&buf);
		while let Some(frame) = decoder.try_next()? {
			match &mut payload {
				None => {
					let total = frame
						.total_size
						.ok_or_else(|| Error::Message("first chunk lacks total_size".into()))?;
					if frame.offset != 0 {
						return Err(Error::Message(format!(
							"first chunk starts at offset {}",
							frame.offset
						)));
					}
					expected_total = total;
					payload = Some(StreamPayload {
						block_id: frame.block_id,
						data: frame.data,
						compression: frame.compression,
					});
				}
				Some(p) => {
					if frame.block_id != p.block_id {
						return Err(Error::Message("chunk stream mixes block ids".into()));
					}
					if frame.offset != p.data.len() as u64 {
						return Err(Error::Message(format!(
							"chunk offset {} does not continue at {} (gap or overlap)",
							frame.offset,
							p.data.len()
						)));
					}
					p.data.extend_from_slice(&frame.data);
				}
			}
		}
	}

	if decoder.has_pending() {
		return Err(Error::Message("truncated chunk frame at end of stream".into()));
	}
	let payload = payload.ok_or_else(|| Error::Message("empty chunk stream".into()))?;
	if payload.data.len() as u64 != expected_total {
		return Err(Error::Message(format!(
			"received {} bytes, stream advertised {}",
			payload.data.len(),
			expected_total
		)));
	}
	Ok(payload)
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::data::gen_uuid;

	fn decode_all(frames: &[Bytes]) -> Vec<ChunkFrame> {
		let mut decoder = FrameDecoder::new();
		let mut out = vec![];
		for f in frames {
			decoder.push(f);
		}
		while let Some(frame) = decoder.try_next().unwrap() {
			out.push(frame);
		}
		assert!(!decoder.has_pending());
		out
	}

	#[test]
	fn test_frame_roundtrip() {
		let id = gen_uuid();
		let payload = vec![3u8; 10 * 1024 * 1024];
		let frames = make_frames(id, &payload, None).unwrap();
		assert_eq!(frames.len(), 3);

		let decoded = decode_all(&frames);
		assert_eq!(decoded[0].total_size, Some(payload.len() as u64));
		assert_eq!(decoded[1].total_size, None);
		assert_eq!(decoded[1].offset, MAX_CHUNK_SIZE as u64);

		let mut data = vec![];
		for f in &decoded {
			data.extend_from_slice(&f.data);
		}
		assert_eq!(data, payload);
	}

	#[test]
	fn test_empty_payload_single_frame() {
		let frames = make_frames(gen_uuid(), &[], None).unwrap();
		assert_eq!(frames.len(), 1);
		let decoded = decode_all(&frames);
		assert_eq!(decoded[0].total_size, Some(0));
		assert!(decoded[0].data.is_empty());
	}

	#[test]
	fn test_decoder_handles_split_input() {
		let id = gen_uuid();
		let frames = make_frames(id, &[1, 2, 3, 4, 5], None).unwrap();
		let raw = frames.concat();

		let mut decoder = FrameDecoder::new();
		// feed one byte at a time
		let mut decoded = vec![];
		for b in raw {
			decoder.push(&[b]);
			while let Some(frame) = decoder.try_next().unwrap() {
				decoded.push(frame);
			}
		}
		assert_eq!(decoded.len(), 1);
		assert_eq!(decoded[0].data, vec![1, 2, 3, 4, 5]);
	}

	#[tokio::test]
	async fn test_collect_frames_gap_detected() {
		let id = gen_uuid();
		let f0 = encode_frame(&ChunkFrame {
			block_id: id,
			offset: 0,
			data: vec![0u8; 16],
			total_size: Some(64),
			compression: None,
		})
		.unwrap();
		// skips bytes 16..32
		let f1 = encode_frame(&ChunkFrame {
			block_id: id,
			offset: 32,
			data: vec![0u8; 32],
			total_size: None,
			compression: None,
		})
		.unwrap();

		let body = frames_to_body(vec![f0, f1]);
		assert!(collect_frames(body).await.is_err());
	}

	#[tokio::test]
	async fn test_collect_frames_ok() {
		let id = gen_uuid();
		let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
		let frames = make_frames(id, &payload, None).unwrap();
		let got = collect_frames(frames_to_body(frames)).await.unwrap();
		assert_eq!(got.block_id, id);
		assert_eq!(got.data, payload);
		assert!(got.compression.is_none());
	}
}
