use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use silo_client::{ClientError, SiloClient};
use silo_coord::{ApiServer, Coordinator};
use silo_node::DataNode;
use silo_rpc::messages::RegisterNodeRequest;
use silo_rpc::CoordinatorClient;
use silo_util::config::{Config, CoordinatorConfig, DataNodeConfig};

const COORD_ADDR: &str = "127.0.0.1:39100";
const NODE_ADDRS: [&str; 2] = ["127.0.0.1:39101", "127.0.0.1:39102"];

/// Resolves once the test raises the cancel flag (or drops the sender)
async fn stop_requested(mut cancel: watch::Receiver<bool>) {
	loop {
		if *cancel.borrow() {
			return;
		}
		if cancel.changed().await.is_err() {
			return;
		}
	}
}

fn base_config(dir: &std::path::Path) -> Config {
	Config {
		metadata_dir: dir.join("meta"),
		data_dir: dir.join("data"),
		block_size: 4,
		replication_factor: 2,
		coordinator: CoordinatorConfig {
			api_bind_addr: COORD_ADDR.parse().unwrap(),
			..Default::default()
		},
		datanode: DataNodeConfig::default(),
	}
}

/// Start a coordinator and two datanodes in-process, registering the nodes
/// with the coordinator
async fn start_cluster(
	dir: &std::path::Path,
	stop: &watch::Receiver<bool>,
) -> (Arc<Coordinator>, Vec<Arc<DataNode>>) {
	let coord_addr: SocketAddr = COORD_ADDR.parse().unwrap();
	let config = base_config(dir);

	let coordinator = Coordinator::new(&config).unwrap();
	tokio::spawn(ApiServer::run(
		coordinator.clone(),
		coord_addr,
		stop_requested(stop.clone()),
	));

	let mut nodes = vec![];
	for (i, addr) in NODE_ADDRS.iter().enumerate() {
		let bind: SocketAddr = addr.parse().unwrap();
		let mut config = base_config(dir);
		config.data_dir = dir.join(format!("node{}", i));
		config.datanode = DataNodeConfig {
			rpc_bind_addr: bind,
			coordinator_addr: coord_addr,
			storage_capacity: Some(1 << 30),
			..Default::default()
		};
		let node = DataNode::new(&config).await.unwrap();
		tokio::spawn(node.clone().run(bind, stop_requested(stop.clone())));
		nodes.push(node);
	}
	tokio::time::sleep(Duration::from_millis(300)).await;

	// registration normally happens through the heartbeat worker; the test
	// drives it by hand
	let control = CoordinatorClient::new(coord_addr);
	for (i, addr) in NODE_ADDRS.iter().enumerate() {
		let bind: SocketAddr = addr.parse().unwrap();
		let entry = control
			.register_node(&RegisterNodeRequest {
				host: bind.ip().to_string(),
				port: bind.port(),
				storage_capacity: 1 << 30,
				available_space: 1 << 30,
			})
			.await
			.unwrap();
		nodes[i].node_id.store(Some(Arc::new(entry.node_id)));
	}

	(coordinator, nodes)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_end_to_end() {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let dir: PathBuf = tmp.to_path_buf();
	let (stop_tx, stop_rx) = watch::channel(false);

	let (_coordinator, _nodes) = start_cluster(&dir, &stop_rx).await;

	let coord_addr: SocketAddr = COORD_ADDR.parse().unwrap();
	let client = SiloClient::new(coord_addr).with_block_size(4);

	// ---- small PUT/GET round trip: 12 bytes, block size 4, R = 2 ----

	let payload = b"hello world\n";
	let local_in = dir.join("hello.txt");
	tokio::fs::write(&local_in, payload).await.unwrap();

	let report = client.put_file(&local_in, "/a/b/hello.txt").await.unwrap();
	assert_eq!(report.blocks, 3);
	assert_eq!(report.file_size, 12);
	assert_eq!(report.replicas_confirmed, 6);

	let info = client
		.coordinator()
		.get_file_info("/a/b/hello.txt")
		.await
		.unwrap();
	assert_eq!(info.blocks.len(), 3);
	for block in &info.blocks {
		assert_eq!(block.block.size, 4);
		assert_eq!(block.locations.len(), 2);
		assert_eq!(block.locations.iter().filter(|l| l.is_leader).count(), 1);
	}

	let local_out = dir.join("hello.out");
	let got = client.get_file("/a/b/hello.txt", &local_out).await.unwrap();
	assert_eq!(got.blocks, 3);
	assert_eq!(got.bytes_written, 12);
	let round_tripped = tokio::fs::read(&local_out).await.unwrap();
	assert_eq!(round_tripped, payload);

	// ---- namespace operations ----

	client.mkdir("/x").await.unwrap();
	client.mkdir_p("/x/y/z").await.unwrap();

	let one_block = dir.join("f.bin");
	tokio::fs::write(&one_block, b"abcd").await.unwrap();
	client.put_file(&one_block, "/x/y/z/f").await.unwrap();

	let listing = client.ls("/x/y/z").await.unwrap();
	assert_eq!(listing.entries.len(), 1);
	assert_eq!(listing.entries[0].name, "f");

	// non-empty directory refuses plain removal, recursive succeeds
	let err = client.rmdir("/x", false).await.unwrap_err();
	match err {
		silo_util::error::Error::Remote(status, _) => {
			assert_eq!(status, hyper::StatusCode::CONFLICT)
		}
		other => panic!("unexpected error: {}", other),
	}
	client.rmdir("/x", true).await.unwrap();
	assert!(client.stat("/x/y/z/f").await.unwrap_err().is_not_found());

	// ---- file removal ----

	client.rm("/a/b/hello.txt").await.unwrap();
	assert!(client.stat("/a/b/hello.txt").await.unwrap_err().is_not_found());
	match client.get_file("/a/b/hello.txt", &local_out).await {
		Err(ClientError::Rpc(e)) if e.is_not_found() => (),
		other => panic!("expected not found, got {:?}", other.map(|_| ())),
	}

	let stats = client.coordinator().system_stats().await.unwrap();
	assert_eq!(stats.files, 0);
	assert_eq!(stats.active_nodes, 2);

	drop(stop_tx);
}

const PEER_A_ADDR: &str = "127.0.0.1:39110";
const PEER_B_ADDR: &str = "127.0.0.1:39111";

fn peer_config(dir: &std::path::Path, name: &str, bind: &str, peer: &str) -> Config {
	Config {
		metadata_dir: dir.join(name).join("meta"),
		data_dir: dir.join(name).join("data"),
		block_size: 4,
		replication_factor: 2,
		coordinator: CoordinatorConfig {
			api_bind_addr: bind.parse().unwrap(),
			known_peers: vec![peer.parse().unwrap()],
			election_timeout: 2,
			peer_heartbeat_interval: 1,
			sync_interval: 1,
			..Default::default()
		},
		datanode: DataNodeConfig::default(),
	}
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
	let give_up = tokio::time::Instant::now() + deadline;
	while !cond() {
		if tokio::time::Instant::now() > give_up {
			panic!("timed out waiting for {}", what);
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover_and_metadata_sync() {
	use silo_util::background::BackgroundRunner;

	let tmp = mktemp::Temp::new_dir().unwrap();
	let dir: PathBuf = tmp.to_path_buf();

	let (stop_a_tx, stop_a_rx) = watch::channel(false);
	let (stop_b_tx, stop_b_rx) = watch::channel(false);

	let a = Coordinator::new(&peer_config(&dir, "a", PEER_A_ADDR, PEER_B_ADDR)).unwrap();
	let b = Coordinator::new(&peer_config(&dir, "b", PEER_B_ADDR, PEER_A_ADDR)).unwrap();

	tokio::spawn(ApiServer::run(
		a.clone(),
		PEER_A_ADDR.parse().unwrap(),
		stop_requested(stop_a_rx.clone()),
	));
	tokio::spawn(ApiServer::run(
		b.clone(),
		PEER_B_ADDR.parse().unwrap(),
		stop_requested(stop_b_rx.clone()),
	));

	let (bg_a, _done_a) = BackgroundRunner::new(stop_a_rx.clone());
	a.spawn_workers(&bg_a).await;
	let (bg_b, _done_b) = BackgroundRunner::new(stop_b_rx.clone());
	b.spawn_workers(&bg_b).await;

	// an election settles on a single leader
	wait_until("a single leader", Duration::from_secs(30), || {
		a.is_leader() != b.is_leader()
	})
	.await;

	let (leader, follower, leader_stop, follower_addr) = if a.is_leader() {
		(&a, &b, stop_a_tx, PEER_B_ADDR)
	} else {
		(&b, &a, stop_b_tx, PEER_A_ADDR)
	};

	// a write on the leader reaches the follower through metadata sync
	leader
		.catalog
		.create_entry("/synced", silo_rpc::types::FileType::Directory, 0, None)
		.unwrap();
	wait_until("metadata sync", Duration::from_secs(15), || {
		follower.catalog.get_by_path("/synced").is_ok()
	})
	.await;

	// kill the leader; the follower takes over within an election round
	leader_stop.send(true).unwrap();
	wait_until("failover", Duration::from_secs(30), || follower.is_leader()).await;

	// writes now succeed through the new leader's control plane
	let control = CoordinatorClient::new(follower_addr.parse().unwrap());
	control
		.create_directory(&silo_rpc::messages::CreateDirectoryRequest {
			path: "/after-failover".to_string(),
			owner: None,
		})
		.await
		.unwrap();
	assert!(follower.catalog.get_by_path("/after-failover").is_ok());
	assert!(follower.catalog.get_by_path("/synced").is_ok());
}
