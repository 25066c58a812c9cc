//! Transfer counters of a storage node, reported via the storage plane
use std::sync::atomic::{AtomicU64, Ordering};

use silo_rpc::messages::TransferStatsReport;

#[derive(Default)]
pub struct TransferStats {
	pub bytes_sent: AtomicU64,
	pub bytes_received: AtomicU64,
	pub compressed_bytes_sent: AtomicU64,
	pub compressed_bytes_received: AtomicU64,
	pub blocks_compressed: AtomicU64,
	pub blocks_plain: AtomicU64,
	pub blocks_transferred: AtomicU64,
	pub blocks_transfer_failed: AtomicU64,
}

impl TransferStats {
	pub fn add(counter: &AtomicU64, value: u64) {
		counter.fetch_add(value, Ordering::Relaxed);
	}

	pub fn report(&self) -> TransferStatsReport {
		TransferStatsReport {
			bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
			bytes_received: self.bytes_received.load(Ordering::Relaxed),
			compressed_bytes_sent: self.compressed_bytes_sent.load(Ordering::Relaxed),
			compressed_bytes_received: self.compressed_bytes_received.load(Ordering::Relaxed),
			blocks_compressed: self.blocks_compressed.load(Ordering::Relaxed),
			blocks_plain: self.blocks_plain.load(Ordering::Relaxed),
			blocks_transferred: self.blocks_transferred.load(Ordering::Relaxed),
			blocks_transfer_failed: self.blocks_transfer_failed.load(Ordering::Relaxed),
		}
	}
}
