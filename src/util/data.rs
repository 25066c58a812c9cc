//! Module containing identifier and hash types used in the whole system
use std::convert::TryInto;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An array of 32 bytes
#[derive(Default, PartialOrd, Ord, Clone, Hash, PartialEq, Eq, Copy)]
pub struct FixedBytes32([u8; 32]);

impl From<[u8; 32]> for FixedBytes32 {
	fn from(x: [u8; 32]) -> FixedBytes32 {
		FixedBytes32(x)
	}
}

impl std::convert::TryFrom<&[u8]> for FixedBytes32 {
	type Error = std::array::TryFromSliceError;
	fn try_from(by: &[u8]) -> Result<Self, Self::Error> {
		Ok(Self(by.try_into()?))
	}
}

impl AsRef<[u8]> for FixedBytes32 {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for FixedBytes32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(&self.0[..8]))
	}
}

impl fmt::Display for FixedBytes32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl FixedBytes32 {
	/// Access the content as a slice
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
	/// Access the content as a mutable slice
	pub fn as_slice_mut(&mut self) -> &mut [u8] {
		&mut self.0
	}
	/// Parse from a 64-character hexadecimal string
	pub fn from_hex(s: &str) -> Option<Self> {
		let mut ret = [0u8; 32];
		hex::decode_to_slice(s, &mut ret).ok()?;
		Some(Self(ret))
	}
}

// Serialized as hex in human-readable formats (JSON control plane, logs),
// as raw bytes in binary formats (Messagepack frames and snapshots).
impl Serialize for FixedBytes32 {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		if serializer.is_human_readable() {
			serializer.serialize_str(&hex::encode(self.0))
		} else {
			serializer.serialize_bytes(&self.0)
		}
	}
}

struct FixedBytes32Visitor;

impl<'de> Visitor<'de> for FixedBytes32Visitor {
	type Value = FixedBytes32;

	fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "a 32-byte value, possibly hex-encoded")
	}

	fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
		FixedBytes32::from_hex(value)
			.ok_or_else(|| E::custom("invalid hex-encoded 32-byte value"))
	}

	fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
		value
			.try_into()
			.map_err(|_| E::custom("invalid length for a 32-byte value"))
	}
}

impl<'de> Deserialize<'de> for FixedBytes32 {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FixedBytes32, D::Error> {
		if deserializer.is_human_readable() {
			deserializer.deserialize_str(FixedBytes32Visitor)
		} else {
			deserializer.deserialize_bytes(FixedBytes32Visitor)
		}
	}
}

/// An opaque identifier (files, blocks, nodes)
pub type Uuid = FixedBytes32;
/// A SHA-256 digest
pub type Hash = FixedBytes32;

/// Generate a random identifier
pub fn gen_uuid() -> Uuid {
	rand::random::<[u8; 32]>().into()
}

/// Compute the SHA-256 digest of a byte slice
pub fn sha256sum(data: &[u8]) -> Hash {
	use sha2::{Digest, Sha256};

	let mut hasher = Sha256::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	hash.into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hex_roundtrip() {
		let id = gen_uuid();
		let hex = id.to_string();
		assert_eq!(hex.len(), 64);
		assert_eq!(FixedBytes32::from_hex(&hex), Some(id));
	}

	#[test]
	fn test_serde_human_readable() {
		let id = gen_uuid();
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{}\"", id));
		let back: Uuid = serde_json::from_str(&json).unwrap();
		assert_eq!(back, id);
	}

	#[test]
	fn test_serde_binary() {
		let id = gen_uuid();
		let packed = rmp_serde::to_vec(&id).unwrap();
		let back: Uuid = rmp_serde::decode::from_read_ref(&packed).unwrap();
		assert_eq!(back, id);
	}

	#[test]
	fn test_sha256sum() {
		// RFC 6234 test vector for "abc"
		let h = sha256sum(b"abc");
		assert_eq!(
			h.to_string(),
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}
}
