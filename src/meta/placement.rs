//! Block placement policy
//!
//! Stateless: every call re-ranks the active nodes with a noisy capacity
//! score, so concurrent clients do not land on the same nodes in lockstep.
//! Used for initial placement, upload failover and re-replication targets.
use std::collections::HashSet;

use rand::prelude::*;

use silo_rpc::messages::PlacementTarget;
use silo_rpc::types::{NodeEntry, NodeStatus};
use silo_util::data::Uuid;

use crate::error::MetaError;

/// Choose up to `replication` nodes to hold a block of `block_size` bytes.
/// The first chosen node is marked as the block's leader.
pub fn choose_nodes(
	nodes: &[NodeEntry],
	block_size: u64,
	replication: usize,
	exclude: &HashSet<Uuid>,
) -> Result<Vec<PlacementTarget>, MetaError> {
	let mut rng = thread_rng();

	let mut candidates = nodes
		.iter()
		.filter(|n| n.status == NodeStatus::Active)
		.filter(|n| n.available_space >= block_size)
		.filter(|n| !exclude.contains(&n.node_id))
		.map(|n| {
			// noisy capacity score: up to 20% of the advertised space is
			// ignored, plus a random tiebreaker
			let noise = 0.8 + 0.2 * rng.gen::<f64>();
			(n.available_space as f64 * noise, rng.gen::<f64>(), n)
		})
		.collect::<Vec<_>>();

	if candidates.is_empty() {
		return Err(MetaError::InsufficientCapacity);
	}

	candidates.sort_by(|a, b| {
		b.0.partial_cmp(&a.0)
			.unwrap_or(std::cmp::Ordering::Equal)
			.then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
	});

	let n_nodes = std::cmp::min(replication, candidates.len());
	Ok(candidates
		.into_iter()
		.take(n_nodes)
		.enumerate()
		.map(|(i, (_, _, node))| PlacementTarget {
			node: node.clone(),
			is_leader: i == 0,
		})
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::data::gen_uuid;

	fn node(space: u64, status: NodeStatus) -> NodeEntry {
		NodeEntry {
			node_id: gen_uuid(),
			host: "127.0.0.1".into(),
			port: 9000,
			status,
			storage_capacity: 1 << 30,
			available_space: space,
			last_heartbeat: 0,
			blocks_stored: 0,
		}
	}

	#[test]
	fn test_replica_count_is_min_of_r_and_candidates() {
		let nodes: Vec<NodeEntry> = (0..2).map(|_| node(1 << 20, NodeStatus::Active)).collect();
		let targets = choose_nodes(&nodes, 1024, 3, &HashSet::new()).unwrap();
		assert_eq!(targets.len(), 2);

		let nodes: Vec<NodeEntry> = (0..5).map(|_| node(1 << 20, NodeStatus::Active)).collect();
		let targets = choose_nodes(&nodes, 1024, 3, &HashSet::new()).unwrap();
		assert_eq!(targets.len(), 3);
	}

	#[test]
	fn test_exactly_one_leader_first() {
		let nodes: Vec<NodeEntry> = (0..4).map(|_| node(1 << 20, NodeStatus::Active)).collect();
		let targets = choose_nodes(&nodes, 1024, 3, &HashSet::new()).unwrap();
		assert!(targets[0].is_leader);
		assert_eq!(targets.iter().filter(|t| t.is_leader).count(), 1);
	}

	#[test]
	fn test_capacity_filter() {
		let nodes = vec![node(100, NodeStatus::Active), node(1 << 20, NodeStatus::Active)];
		let targets = choose_nodes(&nodes, 1024, 3, &HashSet::new()).unwrap();
		assert_eq!(targets.len(), 1);
		assert_eq!(targets[0].node.node_id, nodes[1].node_id);
	}

	#[test]
	fn test_inactive_nodes_skipped() {
		let nodes = vec![node(1 << 20, NodeStatus::Inactive)];
		assert!(matches!(
			choose_nodes(&nodes, 1024, 2, &HashSet::new()),
			Err(MetaError::InsufficientCapacity)
		));
	}

	#[test]
	fn test_exclusion_set_honored() {
		let nodes: Vec<NodeEntry> = (0..3).map(|_| node(1 << 20, NodeStatus::Active)).collect();
		let exclude: HashSet<Uuid> = vec![nodes[0].node_id, nodes[1].node_id].into_iter().collect();
		let targets = choose_nodes(&nodes, 1024, 3, &exclude).unwrap();
		assert_eq!(targets.len(), 1);
		assert_eq!(targets[0].node.node_id, nodes[2].node_id);
	}

	#[test]
	fn test_no_candidates_is_insufficient_capacity() {
		assert!(matches!(
			choose_nodes(&[], 1024, 3, &HashSet::new()),
			Err(MetaError::InsufficientCapacity)
		));
	}
}
