//! Metadata synchronization: the leader periodically pushes a snapshot of
//! its catalog to every known follower
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_meta::snapshot::MetadataSnapshot;
use silo_rpc::messages::{SyncRequest, SyncResponse};
use silo_util::background::{Worker, WorkerStatus};
use silo_util::error::Error;

use crate::coordinator::Coordinator;

pub struct MetadataSyncWorker {
	coordinator: Arc<Coordinator>,
}

impl MetadataSyncWorker {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		Self { coordinator }
	}

	async fn push_snapshot(&self) -> Result<(), Error> {
		let this = &self.coordinator;
		let payload = this.catalog.snapshot()?.encode()?;
		let req = SyncRequest {
			source_id: this.id,
			term: this.election.term(),
			payload,
		};

		for peer in &this.peers {
			match this.peer_client.sync_metadata(*peer, &req).await {
				Ok(resp) if resp.success => {
					debug!("Synced metadata with {}", peer);
				}
				Ok(resp) => {
					debug!("Peer {} refused sync (term {})", peer, resp.term);
				}
				// a timed-out or failed sync is simply retried on the
				// next periodic tick
				Err(e) => debug!("Sync with {} failed: {}", peer, e),
			}
		}
		Ok(())
	}
}

impl Coordinator {
	/// Follower-side sync handler: apply snapshots from any source whose
	/// term is at least ours
	pub fn handle_sync(&self, req: &SyncRequest) -> SyncResponse {
		let local_term = self.election.term();
		if req.term < local_term {
			return SyncResponse {
				success: false,
				term: local_term,
			};
		}
		self.election.note_leader_contact(req.source_id, req.term);

		let applied = MetadataSnapshot::decode(&req.payload)
			.and_then(|snapshot| Ok(self.catalog.apply_snapshot(&snapshot)?));
		match applied {
			Ok(()) => SyncResponse {
				success: true,
				term: self.election.term(),
			},
			Err(e) => {
				warn!("Could not apply metadata snapshot: {}", e);
				SyncResponse {
					success: false,
					term: self.election.term(),
				}
			}
		}
	}
}

#[async_trait]
impl Worker for MetadataSyncWorker {
	fn name(&self) -> String {
		"metadata sync".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if self.coordinator.is_leader() {
			self.push_snapshot().await?;
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(self.coordinator.config.sync_interval)).await;
		WorkerStatus::Busy
	}
}
