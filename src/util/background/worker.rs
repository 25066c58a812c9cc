use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Error;

/// Delay before a worker retries after a failed unit of work
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);
/// How long running workers get to finish their current unit once the
/// shutdown signal fires
const DRAIN_DEADLINE: Duration = Duration::from_secs(9);

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	Busy,
	Idle,
	Done,
}

#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Do one unit of work if one is pending, returning Idle otherwise.
	/// This future is never interrupted before the drain deadline of the
	/// shutdown sequence. Returning an error logs it and retries the
	/// worker after a delay.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Await the next reason to work. This future may be dropped at any
	/// moment; watching must_exit is the processor's job, the receiver is
	/// only passed in so implementations can peek at it.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

/// Runs the workers: each one is driven by its own task, and when the stop
/// signal fires the processor joins them all, aborting whatever is still
/// running after the drain deadline.
pub(crate) struct WorkerProcessor {
	stop_signal: watch::Receiver<bool>,
	worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
}

impl WorkerProcessor {
	pub(crate) fn new(
		worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
		stop_signal: watch::Receiver<bool>,
	) -> Self {
		Self {
			stop_signal,
			worker_chan,
		}
	}

	pub(crate) async fn run(&mut self) {
		let mut tasks: Vec<(String, JoinHandle<()>)> = vec![];
		let mut next_task_id = 1usize;
		// stops being true once every BackgroundRunner handle is gone
		let mut accepting = true;

		while !*self.stop_signal.borrow() {
			select! {
				new_worker = self.worker_chan.recv(), if accepting => {
					match new_worker {
						Some(worker) => {
							let name = worker.name();
							debug!("Starting worker {} (TID {})", name, next_task_id);
							let handle = tokio::spawn(drive_worker(
								worker,
								next_task_id,
								self.stop_signal.clone(),
							));
							tasks.push((name, handle));
							next_task_id += 1;
						}
						None => accepting = false,
					}
				}
				_ = self.stop_signal.changed() => (),
			}
		}

		// Shutting down: give every worker a chance to complete the unit it
		// is on, then cut off the stragglers
		let drain = join_all(tasks.iter_mut().map(|(_, handle)| handle));
		if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_ok() {
			info!("All background workers finished");
		} else {
			for (name, handle) in &tasks {
				if !handle.is_finished() {
					warn!(
						"Worker {} did not finish before the drain deadline, aborting it",
						name
					);
					handle.abort();
				}
			}
		}
	}
}

/// Lifecycle of a single worker: alternate work and wait until it reports
/// Done or the shutdown signal fires
async fn drive_worker(
	mut worker: Box<dyn Worker>,
	task_id: usize,
	mut must_exit: watch::Receiver<bool>,
) {
	let wait_signal = must_exit.clone();
	while !*must_exit.borrow() {
		match worker.work(&mut must_exit).await {
			Ok(WorkerStatus::Busy) => (),
			Ok(WorkerStatus::Done) => break,
			Ok(WorkerStatus::Idle) => {
				select! {
					status = worker.wait_for_work(&wait_signal) => {
						if status == WorkerStatus::Done {
							break;
						}
					}
					_ = must_exit.changed() => (),
				}
			}
			Err(e) => {
				error!(
					"Error in worker {} (TID {}): {}",
					worker.name(),
					task_id,
					e
				);
				// hold back so a persistent failure does not spin the task
				select! {
					_ = tokio::time::sleep(ERROR_RETRY_DELAY) => (),
					_ = must_exit.changed() => (),
				}
			}
		}
	}
	debug!("Worker {} (TID {}) exited", worker.name(), task_id);
}
