//! Runner for long-lived background workers

pub mod worker;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

pub use worker::{Worker, WorkerStatus};
use worker::WorkerProcessor;

/// Runner for background workers: each worker is handed to the processor,
/// which drives it as its own task until the shutdown signal fires and the
/// drain deadline passes
pub struct BackgroundRunner {
	send_worker: mpsc::UnboundedSender<Box<dyn Worker>>,
}

impl BackgroundRunner {
	/// Create a new BackgroundRunner
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		let await_all_done =
			tokio::spawn(
				async move { WorkerProcessor::new(worker_out, stop_signal).run().await },
			);

		let bgrunner = Arc::new(Self { send_worker });
		(bgrunner, await_all_done)
	}

	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		self.send_worker
			.send(Box::new(worker))
			.ok()
			.expect("Could not put worker in queue");
	}
}
