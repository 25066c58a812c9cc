//! Failure detector: scans the datanode registry, marks stale nodes
//! inactive and evicts nodes that stayed silent for too long
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_rpc::types::NodeStatus;
use silo_util::background::{Worker, WorkerStatus};
use silo_util::error::Error;
use silo_util::time::now_msec;

use crate::coordinator::Coordinator;
use crate::replicator::NodeFailure;

pub struct FailureDetectorWorker {
	coordinator: Arc<Coordinator>,
}

impl FailureDetectorWorker {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		Self { coordinator }
	}

	fn scan(&self) -> Result<(), Error> {
		let this = &self.coordinator;
		let now = now_msec();
		let inactive_after = this.config.heartbeat_timeout * 1000;
		let evict_after = this.config.eviction_timeout * 1000;

		let nodes = this.catalog.list_nodes(None)?;

		for node in nodes {
			let silence = now.saturating_sub(node.last_heartbeat);
			match node.status {
				NodeStatus::Active if silence > inactive_after => {
					warn!(
						"Datanode {:?} ({}) missed heartbeats for {}s, marking inactive",
						node.node_id,
						node.addr(),
						silence / 1000
					);
					let blocks = this.catalog.mark_inactive(node.node_id)?;
					info!(
						"{} block(s) lost a location on {:?}",
						blocks.len(),
						node.node_id
					);
					this.report_node_failure(NodeFailure {
						node_id: node.node_id,
						blocks,
					});
				}
				NodeStatus::Inactive if silence > evict_after => {
					info!(
						"Evicting datanode {:?} after {}s of inactivity",
						node.node_id,
						silence / 1000
					);
					this.catalog.evict_node(node.node_id)?;
				}
				_ => (),
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Worker for FailureDetectorWorker {
	fn name(&self) -> String {
		"datanode failure detector".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		// followers converge through metadata sync; only the leader
		// mutates the registry
		if self.coordinator.is_leader() {
			self.scan()?;
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(self.coordinator.config.detector_interval)).await;
		WorkerStatus::Busy
	}
}
