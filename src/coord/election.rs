//! Leader election between coordinator peers
//!
//! Deliberately weaker than a consensus protocol: the goal is best-effort
//! high availability. A peer that observes no leader heartbeat for the
//! election timeout becomes a candidate, bumps its term and asks every
//! known peer for a vote; a vote is granted to the first candidate of a
//! term by peers that are not themselves leader. Losing all peers still
//! lets the survivor take over.
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;

use silo_rpc::messages::*;
use silo_rpc::types::PeerRole;
use silo_util::background::{Worker, WorkerStatus};
use silo_util::data::Uuid;
use silo_util::error::Error;

use crate::coordinator::Coordinator;

pub struct ElectionState {
	self_id: Uuid,
	inner: Mutex<ElectionInner>,
}

struct ElectionInner {
	term: u64,
	role: PeerRole,
	leader_hint: Option<Uuid>,
	/// Vote cast in the current term, if any
	voted_for: Option<Uuid>,
	last_leader_contact: Instant,
}

impl ElectionState {
	/// A peer starts as follower; a coordinator with no known peers is a
	/// single-node cluster and starts as its own leader
	pub fn new(self_id: Uuid, solo: bool) -> Self {
		let (role, term) = if solo {
			(PeerRole::Leader, 1)
		} else {
			(PeerRole::Follower, 0)
		};
		Self {
			self_id,
			inner: Mutex::new(ElectionInner {
				term,
				role,
				leader_hint: if solo { Some(self_id) } else { None },
				voted_for: None,
				last_leader_contact: Instant::now(),
			}),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ElectionInner> {
		self.inner.lock().expect("election state mutex poisoned")
	}

	pub fn term(&self) -> u64 {
		self.lock().term
	}

	pub fn role(&self) -> PeerRole {
		self.lock().role
	}

	pub fn is_leader(&self) -> bool {
		self.lock().role == PeerRole::Leader
	}

	pub fn leader_hint(&self) -> Option<Uuid> {
		self.lock().leader_hint
	}

	pub fn time_since_leader_contact(&self) -> Duration {
		self.lock().last_leader_contact.elapsed()
	}

	/// Vote request handler: grant if we are not leader in the current term
	/// and have not voted yet this term
	pub fn handle_vote_request(&self, req: &VoteRequest) -> VoteResponse {
		let mut inner = self.lock();
		if req.term > inner.term {
			inner.term = req.term;
			inner.role = PeerRole::Follower;
			inner.voted_for = None;
		}
		let grant = req.term >= inner.term
			&& inner.role != PeerRole::Leader
			&& inner.voted_for.map(|v| v == req.candidate_id).unwrap_or(true);
		if grant {
			inner.voted_for = Some(req.candidate_id);
			// granting a vote also defers our own candidacy, which keeps
			// two peers from dueling through escalating terms
			inner.last_leader_contact = Instant::now();
			debug!(
				"Granting vote to {:?} for term {}",
				req.candidate_id, req.term
			);
		}
		VoteResponse {
			vote_granted: grant,
			term: inner.term,
		}
	}

	/// Leader heartbeat handler: accept any leader with a term at least as
	/// recent as ours, stepping down if needed
	pub fn handle_heartbeat(&self, req: &PeerHeartbeatRequest) -> PeerHeartbeatResponse {
		let mut inner = self.lock();
		if req.term >= inner.term {
			if inner.role != PeerRole::Follower && req.leader_id != self.self_id {
				info!(
					"Stepping down: {:?} leads term {}",
					req.leader_id, req.term
				);
				inner.role = PeerRole::Follower;
			}
			if req.term > inner.term {
				inner.voted_for = None;
			}
			inner.term = req.term;
			inner.leader_hint = Some(req.leader_id);
			inner.last_leader_contact = Instant::now();
			PeerHeartbeatResponse {
				success: true,
				term: inner.term,
			}
		} else {
			PeerHeartbeatResponse {
				success: false,
				term: inner.term,
			}
		}
	}

	/// A metadata sync from a live leader also counts as leader contact
	pub fn note_leader_contact(&self, leader_id: Uuid, term: u64) {
		let mut inner = self.lock();
		if term >= inner.term {
			inner.term = term;
			inner.leader_hint = Some(leader_id);
			inner.last_leader_contact = Instant::now();
			if inner.role != PeerRole::Follower && leader_id != self.self_id {
				inner.role = PeerRole::Follower;
			}
		}
	}

	/// Enter candidacy: bump the term, vote for ourselves
	fn start_candidacy(&self) -> u64 {
		let mut inner = self.lock();
		inner.term += 1;
		inner.role = PeerRole::Candidate;
		inner.voted_for = Some(self.self_id);
		inner.leader_hint = None;
		inner.term
	}

	/// Transition to leader if we are still the candidate of `term`
	fn become_leader(&self, term: u64) -> bool {
		let mut inner = self.lock();
		if inner.role == PeerRole::Candidate && inner.term == term {
			inner.role = PeerRole::Leader;
			inner.leader_hint = Some(self.self_id);
			inner.last_leader_contact = Instant::now();
			true
		} else {
			false
		}
	}

	/// Fall back to follower after observing a higher term
	fn observe_term(&self, term: u64) {
		let mut inner = self.lock();
		if term > inner.term {
			inner.term = term;
			inner.role = PeerRole::Follower;
			inner.voted_for = None;
		}
	}
}

/// Worker running the election timeout and candidacy rounds
pub struct ElectionWorker {
	coordinator: Arc<Coordinator>,
	timeout: Duration,
}

impl ElectionWorker {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		let timeout = Duration::from_secs(coordinator.config.election_timeout);
		Self {
			coordinator,
			timeout,
		}
	}

	async fn run_election(&self) -> Result<(), Error> {
		let this = &self.coordinator;
		let term = this.election.start_candidacy();
		info!("Starting election for term {}", term);

		let req = VoteRequest {
			candidate_id: this.id,
			term,
		};
		let votes = join_all(this.peers.iter().map(|peer| {
			let req = req.clone();
			let client = this.peer_client.clone();
			let peer = *peer;
			async move { client.request_vote(peer, &req).await }
		}))
		.await;

		let mut granted = 0;
		for vote in votes.into_iter().flatten() {
			if vote.term > term {
				this.election.observe_term(vote.term);
				return Ok(());
			}
			if vote.vote_granted {
				granted += 1;
			}
		}

		// Votes from at least half the *other* peers suffice: a surviving
		// peer must be able to take over when the rest of the cluster is
		// gone, which is the point of this best-effort design
		if granted >= this.peers.len() / 2 {
			if this.election.become_leader(term) {
				info!("Won election, leading term {}", term);
				this.send_peer_heartbeats().await;
			}
		} else {
			debug!(
				"Election for term {} lost ({}/{} votes)",
				term,
				granted,
				this.peers.len()
			);
		}
		Ok(())
	}
}

#[async_trait]
impl Worker for ElectionWorker {
	fn name(&self) -> String {
		"coordinator election".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let election = &self.coordinator.election;
		if election.role() != PeerRole::Leader
			&& election.time_since_leader_contact() > self.timeout
		{
			self.run_election().await?;
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		// jittered so that peers do not enter candidacy in lockstep
		let jitter = rand::thread_rng().gen_range(0..500);
		tokio::time::sleep(Duration::from_millis(1000 + jitter)).await;
		WorkerStatus::Busy
	}
}

/// Worker emitting the leader's periodic no-op heartbeat
pub struct PeerHeartbeatWorker {
	coordinator: Arc<Coordinator>,
}

impl PeerHeartbeatWorker {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		Self { coordinator }
	}
}

#[async_trait]
impl Worker for PeerHeartbeatWorker {
	fn name(&self) -> String {
		"coordinator peer heartbeat".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if self.coordinator.election.is_leader() {
			self.coordinator.send_peer_heartbeats().await;
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(
			self.coordinator.config.peer_heartbeat_interval,
		))
		.await;
		WorkerStatus::Busy
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::data::gen_uuid;

	#[test]
	fn test_solo_starts_as_leader() {
		let state = ElectionState::new(gen_uuid(), true);
		assert!(state.is_leader());
		assert_eq!(state.term(), 1);
	}

	#[test]
	fn test_vote_granted_once_per_term() {
		let state = ElectionState::new(gen_uuid(), false);
		let a = gen_uuid();
		let b = gen_uuid();

		let r1 = state.handle_vote_request(&VoteRequest {
			candidate_id: a,
			term: 1,
		});
		assert!(r1.vote_granted);
		// same candidate asking again still gets the vote
		let r2 = state.handle_vote_request(&VoteRequest {
			candidate_id: a,
			term: 1,
		});
		assert!(r2.vote_granted);
		// a different candidate of the same term does not
		let r3 = state.handle_vote_request(&VoteRequest {
			candidate_id: b,
			term: 1,
		});
		assert!(!r3.vote_granted);
		// a later term resets the vote
		let r4 = state.handle_vote_request(&VoteRequest {
			candidate_id: b,
			term: 2,
		});
		assert!(r4.vote_granted);
		assert_eq!(state.term(), 2);
	}

	#[test]
	fn test_leader_does_not_vote() {
		let state = ElectionState::new(gen_uuid(), true);
		let r = state.handle_vote_request(&VoteRequest {
			candidate_id: gen_uuid(),
			term: 1,
		});
		assert!(!r.vote_granted);
	}

	#[test]
	fn test_heartbeat_updates_hint_and_term() {
		let state = ElectionState::new(gen_uuid(), false);
		let leader = gen_uuid();
		let r = state.handle_heartbeat(&PeerHeartbeatRequest {
			leader_id: leader,
			term: 3,
		});
		assert!(r.success);
		assert_eq!(state.term(), 3);
		assert_eq!(state.leader_hint(), Some(leader));
		assert!(state.time_since_leader_contact() < Duration::from_secs(1));

		// stale heartbeat refused
		let r = state.handle_heartbeat(&PeerHeartbeatRequest {
			leader_id: gen_uuid(),
			term: 2,
		});
		assert!(!r.success);
		assert_eq!(r.term, 3);
	}

	#[test]
	fn test_leader_steps_down_on_newer_leader() {
		let state = ElectionState::new(gen_uuid(), true);
		assert!(state.is_leader());
		let other = gen_uuid();
		let r = state.handle_heartbeat(&PeerHeartbeatRequest {
			leader_id: other,
			term: 5,
		});
		assert!(r.success);
		assert_eq!(state.role(), PeerRole::Follower);
		assert_eq!(state.leader_hint(), Some(other));
	}

	#[test]
	fn test_candidacy_and_promotion() {
		let state = ElectionState::new(gen_uuid(), false);
		let term = state.start_candidacy();
		assert_eq!(term, 1);
		assert_eq!(state.role(), PeerRole::Candidate);
		assert!(state.become_leader(term));
		assert!(state.is_leader());
		// cannot be promoted again for a stale term
		assert!(!state.become_leader(term - 1));
	}
}
