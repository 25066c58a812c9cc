//! The coordinator aggregate: catalog, election state, peer links and
//! background machinery, constructed once at process init and passed
//! explicitly into every handler
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use silo_meta::Catalog;
use silo_rpc::messages::PeerHeartbeatRequest;
use silo_rpc::types::NodeRef;
use silo_rpc::{DataNodeClient, PeerClient};
use silo_util::background::BackgroundRunner;
use silo_util::config::{Config, CoordinatorConfig};
use silo_util::data::{gen_uuid, Uuid};
use silo_util::error::Error;

use crate::balancer::{Balancer, BalancerWorker};
use crate::election::{ElectionState, ElectionWorker, PeerHeartbeatWorker};
use crate::monitor::FailureDetectorWorker;
use crate::replicator::{NodeFailure, ReplicationWorker};
use crate::sync::MetadataSyncWorker;

pub struct Coordinator {
	/// Identity of this coordinator among its peers
	pub id: Uuid,
	pub config: CoordinatorConfig,
	pub replication_factor: usize,

	pub catalog: Catalog,
	pub election: ElectionState,
	pub peers: Vec<SocketAddr>,
	pub peer_client: PeerClient,
	pub balancer: Balancer,

	failure_tx: mpsc::UnboundedSender<NodeFailure>,
	failure_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeFailure>>>,
}

impl Coordinator {
	pub fn new(config: &Config) -> Result<Arc<Self>, Error> {
		let catalog = Catalog::open(&config.metadata_dir)
			.map_err(|e| Error::Message(format!("cannot open catalog: {}", e)))?;

		let id = gen_uuid();
		let peers = config.coordinator.known_peers.clone();
		let election = ElectionState::new(id, peers.is_empty());
		info!(
			"Coordinator {:?} starting with {} known peer(s)",
			id,
			peers.len()
		);

		let (failure_tx, failure_rx) = mpsc::unbounded_channel();

		Ok(Arc::new(Self {
			id,
			config: config.coordinator.clone(),
			replication_factor: config.replication_factor,
			catalog,
			election,
			peers,
			peer_client: PeerClient::new(),
			balancer: Balancer::new(),
			failure_tx,
			failure_rx: Mutex::new(Some(failure_rx)),
		}))
	}

	pub fn is_leader(&self) -> bool {
		self.election.is_leader()
	}

	/// Queue a node failure for the re-replicator
	pub fn report_node_failure(&self, failure: NodeFailure) {
		if self.failure_tx.send(failure).is_err() {
			error!("Replication worker is gone, dropping node failure event");
		}
	}

	/// Spawn the coordinator background tasks: failure detector,
	/// re-replicator, balancer, election, peer heartbeat and metadata sync
	pub async fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		let failure_rx = self
			.failure_rx
			.lock()
			.await
			.take()
			.expect("spawn_workers called twice");

		bg.spawn_worker(FailureDetectorWorker::new(self.clone()));
		bg.spawn_worker(ReplicationWorker::new(self.clone(), failure_rx));
		bg.spawn_worker(BalancerWorker::new(self.clone()));
		if !self.peers.is_empty() {
			bg.spawn_worker(ElectionWorker::new(self.clone()));
			bg.spawn_worker(PeerHeartbeatWorker::new(self.clone()));
			bg.spawn_worker(MetadataSyncWorker::new(self.clone()));
		}
	}

	/// Send the leader's no-op heartbeat to every known peer
	pub async fn send_peer_heartbeats(&self) {
		let req = PeerHeartbeatRequest {
			leader_id: self.id,
			term: self.election.term(),
		};
		for peer in &self.peers {
			match self.peer_client.heartbeat(*peer, &req).await {
				Ok(resp) if !resp.success => {
					debug!("Peer {} refused heartbeat (term {})", peer, resp.term);
				}
				Ok(_) => (),
				Err(e) => debug!("Peer {} unreachable: {}", peer, e),
			}
		}
	}

	/// Best-effort deletion of block payloads after a namespace removal
	pub fn schedule_block_deletion(&self, orphans: silo_meta::catalog::OrphanedBlocks) {
		if orphans.is_empty() {
			return;
		}
		tokio::spawn(async move {
			for (block_id, holders) in orphans {
				for holder in holders {
					delete_on_node(block_id, &holder).await;
				}
			}
		});
	}
}

async fn delete_on_node(block_id: Uuid, holder: &NodeRef) {
	let client = DataNodeClient::new(&holder.addr());
	match client.delete_block(block_id).await {
		Ok(()) => debug!("Deleted payload of {:?} on {}", block_id, holder.addr()),
		Err(e) => warn!(
			"Could not delete payload of {:?} on {}: {}",
			block_id,
			holder.addr(),
			e
		),
	}
}
