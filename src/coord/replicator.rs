//! Re-replicator: restores the replication factor of blocks that lost a
//! location to a node failure
//!
//! Failures arrive from the detector over a channel; blocks whose
//! restoration fails are kept and retried one detector interval later, so
//! under-replication stays visible in the logs instead of silently
//! persisting.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use silo_meta::placement;
use silo_rpc::types::{NodeRef, NodeStatus};
use silo_rpc::DataNodeClient;
use silo_util::background::{Worker, WorkerStatus};
use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::coordinator::Coordinator;

/// Event fired by the failure detector when a datanode goes inactive
#[derive(Debug)]
pub struct NodeFailure {
	pub node_id: Uuid,
	/// Blocks that had a location on the failed node
	pub blocks: Vec<Uuid>,
}

pub struct ReplicationWorker {
	coordinator: Arc<Coordinator>,
	rx: mpsc::UnboundedReceiver<NodeFailure>,
	queue: VecDeque<(Uuid, Uuid)>,
	retry: Vec<(Uuid, Uuid)>,
}

impl ReplicationWorker {
	pub fn new(coordinator: Arc<Coordinator>, rx: mpsc::UnboundedReceiver<NodeFailure>) -> Self {
		Self {
			coordinator,
			rx,
			queue: VecDeque::new(),
			retry: vec![],
		}
	}

	fn enqueue(&mut self, failure: NodeFailure) {
		for block_id in failure.blocks {
			self.queue.push_back((block_id, failure.node_id));
		}
	}

	/// Bring one block back to the replication factor. Every restored copy
	/// is added as a non-leader location; a surviving leader keeps its role.
	async fn restore_block(&self, block_id: Uuid, failed_node: Uuid) -> Result<(), Error> {
		let this = &self.coordinator;
		let replication = this.replication_factor;

		let block = match this.catalog.get_block_with_locations(block_id) {
			Ok(b) => b,
			// the owning file went away in the meantime, nothing to restore
			Err(silo_meta::MetaError::NoSuchBlock) => return Ok(()),
			Err(e) => return Err(e.into()),
		};

		let live: Vec<_> = block
			.locations
			.iter()
			.filter(|l| l.status == NodeStatus::Active)
			.collect();
		if live.is_empty() {
			// unrecoverable until the node comes back, retrying will not help
			error!(
				"Block {:?} has no remaining live replica after {:?} failed",
				block_id, failed_node
			);
			return Ok(());
		}
		if live.len() >= replication {
			return Ok(());
		}

		let source = live.iter().find(|l| l.is_leader).copied().unwrap_or(live[0]);

		let mut exclude: HashSet<Uuid> = live.iter().map(|l| l.node_id).collect();
		exclude.insert(failed_node);

		let nodes = this.catalog.list_nodes(Some(NodeStatus::Active))?;
		let missing = replication - live.len();
		let targets = placement::choose_nodes(&nodes, block.block.size, missing, &exclude)?;

		for target in targets {
			let target_ref = NodeRef::from(&target.node);
			let source_client = DataNodeClient::new(&source.addr());
			source_client
				.replicate_block(block_id, target_ref.clone())
				.await?;
			this.catalog
				.add_location(block_id, target.node.node_id, false)?;
			info!(
				"Re-replicated block {:?} from {} to {}",
				block_id,
				source.addr(),
				target.node.addr()
			);
		}
		Ok(())
	}
}

#[async_trait]
impl Worker for ReplicationWorker {
	fn name(&self) -> String {
		"block re-replication".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		while let Ok(failure) = self.rx.try_recv() {
			self.enqueue(failure);
		}

		let (block_id, failed_node) = match self.queue.pop_front() {
			Some(x) => x,
			None => return Ok(WorkerStatus::Idle),
		};

		if let Err(e) = self.restore_block(block_id, failed_node).await {
			warn!(
				"Re-replication of block {:?} failed, will retry: {}",
				block_id, e
			);
			self.retry.push((block_id, failed_node));
		}
		Ok(WorkerStatus::Busy)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		if !self.retry.is_empty() {
			tokio::time::sleep(Duration::from_secs(self.coordinator.config.detector_interval))
				.await;
			self.queue.extend(self.retry.drain(..));
			return WorkerStatus::Busy;
		}
		match self.rx.recv().await {
			Some(failure) => {
				self.enqueue(failure);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}
