//! Load balancer: keeps per-node utilization within a band around the mean
//! by moving blocks from overloaded to underloaded datanodes
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_meta::MetaError;
use silo_rpc::messages::BalanceStatus;
use silo_rpc::types::{NodeEntry, NodeRef, NodeStatus};
use silo_rpc::DataNodeClient;
use silo_util::background::{Worker, WorkerStatus};
use silo_util::data::Uuid;
use silo_util::error::Error;
use silo_util::time::now_msec;

use crate::coordinator::Coordinator;

/// At most a quarter of a node's inventory moves per cycle
const MAX_MOVE_FRACTION: usize = 4;

#[derive(Default)]
pub struct Balancer {
	in_progress: AtomicBool,
	blocks_moved: AtomicU64,
	last_cycle: std::sync::Mutex<Option<u64>>,
}

impl Balancer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn status(&self, nodes: &[NodeEntry], threshold: f64) -> BalanceStatus {
		let (mean, stddev) = utilization_stats(nodes);
		BalanceStatus {
			in_progress: self.in_progress.load(Ordering::SeqCst),
			average_utilization: mean,
			utilization_stddev: stddev,
			is_balanced: stddev <= threshold,
			blocks_moved: self.blocks_moved.load(Ordering::SeqCst),
			last_cycle: *self.last_cycle.lock().expect("balancer mutex poisoned"),
		}
	}

	/// Run one balancing cycle. A second call while a cycle is in progress
	/// is refused.
	pub async fn run_cycle(&self, coordinator: &Coordinator) -> Result<BalanceStatus, MetaError> {
		if self
			.in_progress
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Err(MetaError::AlreadyExists("balancing cycle".to_string()));
		}
		let result = self.cycle_inner(coordinator).await;
		*self.last_cycle.lock().expect("balancer mutex poisoned") = Some(now_msec());
		self.in_progress.store(false, Ordering::SeqCst);
		result
	}

	async fn cycle_inner(&self, coordinator: &Coordinator) -> Result<BalanceStatus, MetaError> {
		let threshold = coordinator.config.balance_threshold;
		let nodes = coordinator.catalog.list_nodes(Some(NodeStatus::Active))?;

		let (mean, stddev) = utilization_stats(&nodes);
		if nodes.len() < 2 || stddev <= threshold {
			debug!(
				"Utilization stddev {:.3} within threshold {:.3}, nothing to move",
				stddev, threshold
			);
			return Ok(self.status(&nodes, threshold));
		}

		let (overloaded, underloaded) = classify(&nodes, mean, threshold);
		info!(
			"Balancing: mean utilization {:.2}, {} overloaded, {} underloaded",
			mean,
			overloaded.len(),
			underloaded.len()
		);

		// projected free space of each target, updated as moves are planned
		let mut targets: Vec<(NodeEntry, u64)> = underloaded
			.iter()
			.map(|n| (n.clone(), n.available_space))
			.collect();

		for source in &overloaded {
			let blocks = coordinator.catalog.blocks_on_node(source.node_id)?;
			let quota = move_quota(source, &blocks, mean, threshold);
			if quota == 0 {
				continue;
			}
			let chosen = select_blocks(blocks, quota);
			info!(
				"Moving up to {} block(s) away from {:?}",
				chosen.len(),
				source.node_id
			);

			for block in chosen {
				let holders: Vec<Uuid> = coordinator
					.catalog
					.get_block_with_locations(block.block_id)?
					.locations
					.iter()
					.map(|l| l.node_id)
					.collect();

				let target = match pick_target(&mut targets, &holders, block.size) {
					Some(t) => t,
					None => continue,
				};

				if let Err(e) = self
					.move_block(coordinator, source, &block.block_id, block.size, &target)
					.await
				{
					warn!(
						"Moving block {:?} from {:?} to {:?} failed: {}",
						block.block_id, source.node_id, target.node_id, e
					);
				}
			}
		}

		let nodes = coordinator.catalog.list_nodes(Some(NodeStatus::Active))?;
		Ok(self.status(&nodes, threshold))
	}

	async fn move_block(
		&self,
		coordinator: &Coordinator,
		source: &NodeEntry,
		block_id: &Uuid,
		_size: u64,
		target: &NodeRef,
	) -> Result<(), Error> {
		let source_client = DataNodeClient::new(&source.addr());
		source_client
			.transfer_block(*block_id, target.clone())
			.await?;

		coordinator
			.catalog
			.add_location(*block_id, target.node_id, false)?;
		coordinator
			.catalog
			.remove_location(*block_id, source.node_id)?;

		// the source kept its payload through the transfer; now that the
		// location is evicted, reclaim the space
		if let Err(e) = source_client.delete_block(*block_id).await {
			warn!(
				"Could not reclaim payload of {:?} on {:?}: {}",
				block_id, source.node_id, e
			);
		}

		self.blocks_moved.fetch_add(1, Ordering::SeqCst);
		info!(
			"Moved block {:?} from {:?} to {:?}",
			block_id, source.node_id, target.node_id
		);
		Ok(())
	}
}

fn utilization_stats(nodes: &[NodeEntry]) -> (f64, f64) {
	if nodes.is_empty() {
		return (0.0, 0.0);
	}
	let utils: Vec<f64> = nodes.iter().map(|n| n.utilization()).collect();
	let mean = utils.iter().sum::<f64>() / utils.len() as f64;
	let variance = utils.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / utils.len() as f64;
	(mean, variance.sqrt())
}

/// Split nodes into overloaded (descending utilization) and underloaded
/// (ascending utilization) relative to the band around the mean
fn classify(nodes: &[NodeEntry], mean: f64, threshold: f64) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
	let mut overloaded: Vec<NodeEntry> = nodes
		.iter()
		.filter(|n| n.utilization() - mean > threshold)
		.cloned()
		.collect();
	let mut underloaded: Vec<NodeEntry> = nodes
		.iter()
		.filter(|n| mean - n.utilization() > threshold)
		.cloned()
		.collect();
	overloaded.sort_by(|a, b| {
		b.utilization()
			.partial_cmp(&a.utilization())
			.unwrap_or(std::cmp::Ordering::Equal)
	});
	underloaded.sort_by(|a, b| {
		a.utilization()
			.partial_cmp(&b.utilization())
			.unwrap_or(std::cmp::Ordering::Equal)
	});
	(overloaded, underloaded)
}

/// How many blocks to move off an overloaded node this cycle, bounded to a
/// quarter of its inventory
fn move_quota(
	node: &NodeEntry,
	blocks: &[(silo_rpc::types::BlockEntry, usize)],
	mean: f64,
	threshold: f64,
) -> usize {
	if blocks.is_empty() {
		return 0;
	}
	let target_utilization = mean + threshold / 2.0;
	let current = node.utilization();
	if current <= target_utilization {
		return 0;
	}
	let space_to_free = node.storage_capacity as f64 * (current - target_utilization);
	let avg_block_size =
		blocks.iter().map(|(b, _)| b.size).sum::<u64>() as f64 / blocks.len() as f64;
	if avg_block_size <= 0.0 {
		return 0;
	}
	let wanted = (space_to_free / avg_block_size) as usize;
	std::cmp::min(wanted, std::cmp::max(1, blocks.len() / MAX_MOVE_FRACTION))
}

/// Choose the blocks to move: already-replicated ones first, larger first,
/// falling back to the remaining inventory if not enough are replicated
fn select_blocks(
	mut blocks: Vec<(silo_rpc::types::BlockEntry, usize)>,
	quota: usize,
) -> Vec<silo_rpc::types::BlockEntry> {
	blocks.sort_by(|a, b| {
		let a_repl = (a.1 > 1) as u8;
		let b_repl = (b.1 > 1) as u8;
		b_repl.cmp(&a_repl).then(b.0.size.cmp(&a.0.size))
	});
	blocks.into_iter().take(quota).map(|(b, _)| b).collect()
}

/// Lowest-utilization target that does not hold the block and has the space
fn pick_target(
	targets: &mut Vec<(NodeEntry, u64)>,
	holders: &[Uuid],
	block_size: u64,
) -> Option<NodeRef> {
	let (node_ref, avail) = targets
		.iter_mut()
		.filter(|t| !holders.contains(&t.0.node_id) && t.1 >= block_size)
		.min_by(|a, b| {
			let ua = (a.0.storage_capacity.saturating_sub(a.1)) as f64;
			let ub = (b.0.storage_capacity.saturating_sub(b.1)) as f64;
			ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
		})
		.map(|(n, avail)| (NodeRef::from(&*n), avail))?;
	*avail -= block_size;
	Some(node_ref)
}

pub struct BalancerWorker {
	coordinator: Arc<Coordinator>,
}

impl BalancerWorker {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		Self { coordinator }
	}
}

#[async_trait]
impl Worker for BalancerWorker {
	fn name(&self) -> String {
		"load balancer".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let this = &self.coordinator;
		if this.config.auto_balance && this.is_leader() {
			match this.balancer.run_cycle(this).await {
				Ok(status) if status.is_balanced => (),
				Ok(status) => info!(
					"Balance cycle done, stddev now {:.3}",
					status.utilization_stddev
				),
				Err(MetaError::AlreadyExists(_)) => (),
				Err(e) => return Err(e.into()),
			}
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(self.coordinator.config.balance_interval)).await;
		WorkerStatus::Busy
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_rpc::types::BlockEntry;
	use silo_util::data::gen_uuid;

	fn node(capacity: u64, available: u64) -> NodeEntry {
		NodeEntry {
			node_id: gen_uuid(),
			host: "127.0.0.1".into(),
			port: 9000,
			status: NodeStatus::Active,
			storage_capacity: capacity,
			available_space: available,
			last_heartbeat: 0,
			blocks_stored: 0,
		}
	}

	fn block(size: u64) -> BlockEntry {
		BlockEntry {
			block_id: gen_uuid(),
			file_id: gen_uuid(),
			size,
			checksum: None,
		}
	}

	#[test]
	fn test_classification_bands() {
		// utilizations 0.9, 0.5, 0.1 -> mean 0.5
		let nodes = vec![node(100, 10), node(100, 50), node(100, 90)];
		let (mean, stddev) = utilization_stats(&nodes);
		assert!((mean - 0.5).abs() < 1e-9);
		assert!(stddev > 0.2);

		let (over, under) = classify(&nodes, mean, 0.2);
		assert_eq!(over.len(), 1);
		assert_eq!(over[0].node_id, nodes[0].node_id);
		assert_eq!(under.len(), 1);
		assert_eq!(under[0].node_id, nodes[2].node_id);
	}

	#[test]
	fn test_move_quota_bounded_to_quarter() {
		let n = node(1000, 50); // utilization 0.95
		let blocks: Vec<_> = (0..40).map(|_| (block(10), 2)).collect();
		let quota = move_quota(&n, &blocks, 0.5, 0.2);
		assert!(quota > 0);
		assert!(quota <= 10);
	}

	#[test]
	fn test_select_blocks_prefers_replicated_and_larger() {
		let lone_big = (block(100), 1);
		let repl_small = (block(10), 2);
		let repl_big = (block(50), 3);
		let picked = select_blocks(vec![lone_big.clone(), repl_small.clone(), repl_big.clone()], 2);
		assert_eq!(picked[0].block_id, repl_big.0.block_id);
		assert_eq!(picked[1].block_id, repl_small.0.block_id);
	}

	#[test]
	fn test_pick_target_skips_holders_and_tracks_space() {
		let a = node(100, 60);
		let b = node(100, 80);
		let mut targets = vec![(a.clone(), 60), (b.clone(), 80)];

		// b has the lowest utilization but already holds the block
		let t = pick_target(&mut targets, &[b.node_id], 10).unwrap();
		assert_eq!(t.node_id, a.node_id);
		assert_eq!(targets[0].1, 50);

		// not enough projected space left
		assert!(pick_target(&mut targets, &[], 90).is_none());
	}
}
