use std::path::PathBuf;

use tokio::sync::watch;

use silo_util::background::BackgroundRunner;
use silo_util::config::read_config;
use silo_util::error::Error;

use silo_coord::{ApiServer, Coordinator};
use silo_node::DataNode;

/// Resolves once the cancel flag is raised (or every sender is gone, which
/// also means the process is going down)
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

pub async fn run_coordinator(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Opening metadata catalog...");
	let coordinator = Coordinator::new(&config)?;

	info!("Initializing background runner...");
	let watch_cancel = shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Spawning coordinator workers...");
	coordinator.spawn_workers(&background).await;

	info!("Launching control plane...");
	let api_server = tokio::spawn(ApiServer::run(
		coordinator.clone(),
		config.coordinator.api_bind_addr,
		stop_requested(watch_cancel.clone()),
	));

	if let Err(e) = api_server.await? {
		error!("Control plane exited with error: {}", e);
	} else {
		info!("Control plane exited without error.");
	}

	// Drop all references so that background tasks can terminate properly
	drop(coordinator);

	await_background_done.await?;
	info!("Cleaning up...");

	Ok(())
}

pub async fn run_datanode(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Opening local block store...");
	let node = DataNode::new(&config).await?;

	info!("Initializing background runner...");
	let watch_cancel = shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Spawning datanode workers...");
	node.spawn_workers(&background);

	info!("Launching block service...");
	let bind_addr = config.datanode.rpc_bind_addr;
	let block_service = tokio::spawn(node.clone().run(bind_addr, stop_requested(watch_cancel.clone())));

	if let Err(e) = block_service.await? {
		error!("Block service exited with error: {}", e);
	} else {
		info!("Block service exited without error.");
	}

	drop(node);

	await_background_done.await?;
	info!("Cleaning up...");

	Ok(())
}

/// Raise a cancel flag on the first termination signal. The watch receiver
/// feeds both the background runner and the graceful-shutdown hooks of the
/// HTTP servers.
#[cfg(unix)]
fn shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::{signal, SignalKind};

	let (cancel_tx, cancel_rx) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint =
			signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("cannot install SIGHUP handler");
		let caught = tokio::select! {
			_ = sigint.recv() => "SIGINT",
			_ = sigterm.recv() => "SIGTERM",
			_ = sighup.recv() => "SIGHUP",
		};
		info!("{} caught, shutting down", caught);
		let _ = cancel_tx.send(true);
	});
	cancel_rx
}

#[cfg(not(unix))]
fn shutdown_signal() -> watch::Receiver<bool> {
	let (cancel_tx, cancel_rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("Ctrl-C caught, shutting down");
		}
		let _ = cancel_tx.send(true);
	});
	cancel_rx
}
