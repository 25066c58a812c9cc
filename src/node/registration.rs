//! Registration of a storage node with the coordinator, and the periodic
//! heartbeat carrying liveness, free space and the block inventory
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_rpc::messages::{HeartbeatRequest, RegisterNodeRequest};
use silo_util::background::{Worker, WorkerStatus};
use silo_util::error::Error;

use crate::service::DataNode;

impl DataNode {
	/// Spawn the node's background tasks
	pub fn spawn_workers(self: &Arc<Self>, bg: &silo_util::background::BackgroundRunner) {
		bg.spawn_worker(HeartbeatWorker::new(self.clone()));
	}

	/// Announced capacity and free space. With a configured capacity, free
	/// space is derived from the bytes actually stored; otherwise both come
	/// from the filesystem holding the data directory.
	pub async fn capacity_info(&self) -> Result<(u64, u64), Error> {
		match self.config.storage_capacity {
			Some(capacity) => {
				let used = self.store.used_space().await?;
				Ok((capacity, capacity.saturating_sub(used)))
			}
			None => self.store.disk_space(),
		}
	}
}

pub struct HeartbeatWorker {
	node: Arc<DataNode>,
}

impl HeartbeatWorker {
	pub fn new(node: Arc<DataNode>) -> Self {
		Self { node }
	}

	async fn register(&self) -> Result<(), Error> {
		let addr = self.node.announced_addr();
		let (storage_capacity, available_space) = self.node.capacity_info().await?;
		let entry = self
			.node
			.coordinator
			.register_node(&RegisterNodeRequest {
				host: addr.ip().to_string(),
				port: addr.port(),
				storage_capacity,
				available_space,
			})
			.await?;
		info!(
			"Registered with coordinator as {:?} ({} bytes available)",
			entry.node_id, available_space
		);
		self.node.node_id.store(Some(Arc::new(entry.node_id)));
		Ok(())
	}

	async fn heartbeat(&self, node_id: silo_util::data::Uuid) -> Result<(), Error> {
		let blocks = self.node.store.inventory().await?;
		let (_, available_space) = self.node.capacity_info().await?;
		self.node
			.coordinator
			.heartbeat(
				node_id,
				&HeartbeatRequest {
					available_space,
					blocks,
				},
			)
			.await
	}
}

#[async_trait]
impl Worker for HeartbeatWorker {
	fn name(&self) -> String {
		"datanode heartbeat".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		match self.node.node_id.load_full() {
			None => {
				self.register().await?;
				Ok(WorkerStatus::Idle)
			}
			Some(node_id) => match self.heartbeat(*node_id).await {
				Ok(()) => Ok(WorkerStatus::Idle),
				Err(e) if e.is_not_found() => {
					// The coordinator no longer knows us (restart or
					// eviction): go back through registration right away
					warn!("Coordinator dropped our registration, re-registering");
					self.node.node_id.store(None);
					Ok(WorkerStatus::Busy)
				}
				Err(e) => Err(e),
			},
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(self.node.config.heartbeat_interval)).await;
		WorkerStatus::Busy
	}
}
